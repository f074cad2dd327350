//! Remote KV + pub/sub store seam
//!
//! `ResilientCache` talks to the shared store only through `RemoteStore`.
//! `InProcessStore` is a shared in-memory implementation for single-node runs
//! and tests; the Redis adapter lives behind the `redis` feature.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use super::local::glob_match;

/// Messages received on a subscribed channel
pub type MessageStream = BoxStream<'static, Vec<u8>>;

#[derive(Debug, Clone)]
pub enum RemoteError {
    Unavailable(String),
    Timeout(Duration),
    Protocol(String),
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(reason) => write!(f, "remote store unavailable: {}", reason),
            Self::Timeout(d) => write!(f, "remote store call timed out after {}ms", d.as_millis()),
            Self::Protocol(reason) => write!(f, "remote store protocol error: {}", reason),
        }
    }
}

impl std::error::Error for RemoteError {}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), RemoteError>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, RemoteError>;

    async fn exists(&self, key: &str) -> Result<bool, RemoteError>;

    /// Keys matching a glob pattern.
    async fn scan_pattern(&self, pattern: &str) -> Result<Vec<String>, RemoteError>;

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), RemoteError>;

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, RemoteError>;

    async fn ping(&self) -> Result<(), RemoteError>;
}

/// Turn a broadcast receiver into a message stream; lagged receivers skip ahead.
pub fn receiver_stream(rx: broadcast::Receiver<Vec<u8>>) -> MessageStream {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(msg) => return Some((msg, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "pub/sub subscriber lagged; messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct InProcessInner {
    entries: HashMap<String, (Vec<u8>, Option<Instant>)>,
    channels: HashMap<String, broadcast::Sender<Vec<u8>>>,
}

/// Shared in-memory remote store. Cloning an `Arc` of it across several
/// `ResilientCache` instances simulates multiple service instances.
#[derive(Debug, Default)]
pub struct InProcessStore {
    inner: Mutex<InProcessInner>,
}

impl InProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(inner: &mut InProcessInner, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        match inner.entries.get(key) {
            Some((_, Some(exp))) if now >= *exp => {}
            Some((value, _)) => return Some(value.clone()),
            None => return None,
        }
        inner.entries.remove(key);
        None
    }
}

#[async_trait]
impl RemoteStore for InProcessStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        Ok(Self::live_value(&mut self.inner.lock(), key))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), RemoteError> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.inner
            .lock()
            .entries
            .insert(key.to_string(), (value.to_vec(), expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, RemoteError> {
        let mut inner = self.inner.lock();
        let live = Self::live_value(&mut inner, key).is_some();
        inner.entries.remove(key);
        Ok(live)
    }

    async fn exists(&self, key: &str) -> Result<bool, RemoteError> {
        Ok(Self::live_value(&mut self.inner.lock(), key).is_some())
    }

    async fn scan_pattern(&self, pattern: &str) -> Result<Vec<String>, RemoteError> {
        let now = Instant::now();
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .iter()
            .filter(|(_, (_, exp))| exp.map(|t| now < t).unwrap_or(true))
            .filter(|(key, _)| glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), RemoteError> {
        let inner = self.inner.lock();
        if let Some(tx) = inner.channels.get(channel) {
            // No subscribers is not an error for pub/sub
            let _ = tx.send(payload.to_vec());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, RemoteError> {
        let rx = {
            let mut inner = self.inner.lock();
            inner
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };
        Ok(receiver_stream(rx))
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}
