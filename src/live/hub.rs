//! Topic fan-out hub
//!
//! Connections and topics are indexed both ways. Each connection owns a
//! bounded outbound queue; a full or closed queue is a send failure and
//! drops that connection only. Per-topic loops start with the first member
//! and are aborted with the last.
//!
//! Lock order: connection topics -> topic map -> topic members.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::messages::{ClientMessage, LiveMessage};

pub type ConnectionId = Uuid;

/// Serialized frame shared by every recipient of a broadcast
pub type Frame = Arc<str>;

#[derive(Debug, Clone, PartialEq)]
pub enum HubError {
    UnknownConnection(ConnectionId),
    SendFailed(ConnectionId),
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownConnection(id) => write!(f, "unknown connection {}", id),
            Self::SendFailed(id) => write!(f, "send to connection {} failed", id),
        }
    }
}

impl std::error::Error for HubError {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Starts the background loops that feed a topic.
pub trait TopicDriver: Send + Sync {
    fn spawn_loops(&self, hub: &BroadcastHub, topic: &str) -> Vec<JoinHandle<()>>;
}

struct ConnectionSlot {
    tx: mpsc::Sender<Frame>,
    topics: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

#[derive(Default)]
struct TopicState {
    members: Mutex<HashMap<ConnectionId, mpsc::Sender<Frame>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct HubInner {
    buffer: usize,
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionSlot>>>,
    topics: RwLock<HashMap<String, Arc<TopicState>>>,
    driver: Option<Arc<dyn TopicDriver>>,
}

#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    /// Hub without topic loops; topics are fed only through
    /// `broadcast_to_topic`.
    pub fn new(buffer: usize) -> Self {
        Self::build(buffer, None)
    }

    pub fn with_driver(buffer: usize, driver: Arc<dyn TopicDriver>) -> Self {
        Self::build(buffer, Some(driver))
    }

    fn build(buffer: usize, driver: Option<Arc<dyn TopicDriver>>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                buffer: buffer.max(1),
                connections: RwLock::new(HashMap::new()),
                topics: RwLock::new(HashMap::new()),
                driver,
            }),
        }
    }

    /// Register a connection. The receiver is drained by the socket writer.
    pub fn connect(&self) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = Uuid::new_v4();
        let slot = Arc::new(ConnectionSlot {
            tx,
            topics: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        });
        self.inner.connections.write().insert(id, slot);
        debug!(connection = %id, "Live connection registered");
        (id, rx)
    }

    fn slot(&self, id: ConnectionId) -> Result<Arc<ConnectionSlot>, HubError> {
        self.inner
            .connections
            .read()
            .get(&id)
            .cloned()
            .ok_or(HubError::UnknownConnection(id))
    }

    /// Returns false if already subscribed.
    pub fn subscribe(&self, id: ConnectionId, topic: &str) -> Result<bool, HubError> {
        let slot = self.slot(id)?;
        let mut topics = slot.topics.lock();
        if slot.closed.load(Ordering::Acquire) {
            return Err(HubError::UnknownConnection(id));
        }
        if !topics.insert(topic.to_string()) {
            return Ok(false);
        }
        self.join(topic, id, slot.tx.clone());
        Ok(true)
    }

    /// Returns false if not subscribed.
    pub fn unsubscribe(&self, id: ConnectionId, topic: &str) -> Result<bool, HubError> {
        let slot = self.slot(id)?;
        let mut topics = slot.topics.lock();
        if !topics.remove(topic) {
            return Ok(false);
        }
        self.leave(topic, id);
        Ok(true)
    }

    fn join(&self, topic: &str, id: ConnectionId, tx: mpsc::Sender<Frame>) {
        let mut map = self.inner.topics.write();
        let state = match map.get(topic) {
            Some(state) => state.clone(),
            None => {
                let state = Arc::new(TopicState::default());
                map.insert(topic.to_string(), state.clone());
                if let Some(driver) = &self.inner.driver {
                    *state.tasks.lock() = driver.spawn_loops(self, topic);
                }
                info!(topic = %topic, "Topic activated");
                state
            }
        };
        state.members.lock().insert(id, tx);
    }

    fn leave(&self, topic: &str, id: ConnectionId) {
        let mut map = self.inner.topics.write();
        let Some(state) = map.get(topic).cloned() else {
            return;
        };
        let now_empty = {
            let mut members = state.members.lock();
            members.remove(&id);
            members.is_empty()
        };
        if now_empty {
            map.remove(topic);
            let tasks = std::mem::take(&mut *state.tasks.lock());
            for task in &tasks {
                task.abort();
            }
            info!(topic = %topic, loops = tasks.len(), "Topic deactivated");
        }
    }

    /// Remove a connection from every topic. Idempotent; returns whether
    /// this call did the removal.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let Some(slot) = self.inner.connections.write().remove(&id) else {
            return false;
        };
        slot.closed.store(true, Ordering::Release);

        let mut topics = slot.topics.lock();
        for topic in topics.drain() {
            self.leave(&topic, id);
        }
        debug!(connection = %id, "Live connection removed");
        true
    }

    /// Deliver to every member of a topic. A failed send drops only that
    /// connection.
    pub fn broadcast_to_topic(&self, topic: &str, message: &LiveMessage) -> BroadcastReport {
        let frame: Frame = Arc::from(message.to_json());
        self.broadcast_frame(topic, frame)
    }

    pub fn broadcast_frame(&self, topic: &str, frame: Frame) -> BroadcastReport {
        let state = match self.inner.topics.read().get(topic) {
            Some(state) => state.clone(),
            None => return BroadcastReport::default(),
        };

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        {
            let members = state.members.lock();
            for (id, tx) in members.iter() {
                match tx.try_send(frame.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(_) => failed.push(*id),
                }
            }
        }

        for id in failed {
            warn!(topic = %topic, connection = %id, "Live send failed; dropping connection");
            self.disconnect(id);
            report.dropped += 1;
        }

        metrics::counter!("edgeline_broadcast_delivered_total", report.delivered as u64);
        if report.dropped > 0 {
            metrics::counter!("edgeline_broadcast_dropped_total", report.dropped as u64);
        }
        report
    }

    /// Direct reply to one connection. A failed send drops it.
    pub fn send_to(&self, id: ConnectionId, message: &LiveMessage) -> Result<(), HubError> {
        let slot = self.slot(id)?;
        if slot.tx.try_send(Arc::from(message.to_json())).is_err() {
            warn!(connection = %id, "Live reply failed; dropping connection");
            self.disconnect(id);
            return Err(HubError::SendFailed(id));
        }
        Ok(())
    }

    /// Apply one text frame from a client.
    pub fn handle_client_text(&self, id: ConnectionId, text: &str) -> Result<(), HubError> {
        let reply = match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Subscribe { match_id }) => {
                self.subscribe(id, &match_id)?;
                LiveMessage::Subscribed { match_id }
            }
            Ok(ClientMessage::Unsubscribe { match_id }) => {
                self.unsubscribe(id, &match_id)?;
                LiveMessage::Unsubscribed { match_id }
            }
            Ok(ClientMessage::Ping { timestamp }) => LiveMessage::Pong { timestamp },
            Err(e) => LiveMessage::Error {
                message: format!("unrecognized message: {}", e),
            },
        };
        self.send_to(id, &reply)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.inner.connections.read().contains_key(&id)
    }

    pub fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.topics.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn topic_members(&self, topic: &str) -> Vec<ConnectionId> {
        match self.inner.topics.read().get(topic) {
            Some(state) => state.members.lock().keys().copied().collect(),
            None => Vec::new(),
        }
    }

    pub fn topics_of(&self, id: ConnectionId) -> Vec<String> {
        match self.inner.connections.read().get(&id) {
            Some(slot) => {
                let mut topics: Vec<String> = slot.topics.lock().iter().cloned().collect();
                topics.sort();
                topics
            }
            None => Vec::new(),
        }
    }

    /// Number of running loops bound to a topic.
    pub fn topic_loop_count(&self, topic: &str) -> usize {
        match self.inner.topics.read().get(topic) {
            Some(state) => state.tasks.lock().iter().filter(|t| !t.is_finished()).count(),
            None => 0,
        }
    }
}
