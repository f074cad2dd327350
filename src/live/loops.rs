//! Per-topic background loops
//!
//! Three tasks per active topic, all aborted when the topic empties:
//! - event listener on `match_events:{match_id}` (resubscribes with backoff)
//! - odds poller: diff against the last book this task saw, broadcast
//!   changes, refresh the cached snapshot, alert on newly crossed value bets
//! - metric poller: live calibrated probabilities from the cached prediction

use chrono::Utc;
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::hub::{BroadcastHub, TopicDriver};
use super::invalidation::Revalidator;
use super::messages::{LiveMessage, MatchEventEnvelope};
use crate::cache::ResilientCache;
use crate::config::LiveConfig;
use crate::prediction::models::{OddsBook, Outcome, ValueBet};
use crate::prediction::{PredictionOrchestrator, Repository};

const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(30);
const ODDS_CALL_TIMEOUT: Duration = Duration::from_secs(5);
const ODDS_SNAPSHOT_TTL: Duration = Duration::from_secs(300);

pub fn event_channel(match_id: &str) -> String {
    format!("match_events:{}", match_id)
}

pub fn odds_key(match_id: &str) -> String {
    format!("odds:latest:{}", match_id)
}

#[derive(Clone)]
pub struct LiveLoops {
    cache: Arc<ResilientCache>,
    orchestrator: Arc<PredictionOrchestrator>,
    repository: Arc<dyn Repository>,
    revalidator: Revalidator,
    config: LiveConfig,
}

impl LiveLoops {
    pub fn new(
        cache: Arc<ResilientCache>,
        orchestrator: Arc<PredictionOrchestrator>,
        repository: Arc<dyn Repository>,
        revalidator: Revalidator,
        config: LiveConfig,
    ) -> Self {
        Self {
            cache,
            orchestrator,
            repository,
            revalidator,
            config,
        }
    }

    async fn run_event_listener(self, hub: BroadcastHub, topic: String) {
        let channel = event_channel(&topic);
        let mut delay = Duration::from_secs(1);

        loop {
            let mut stream = self.cache.subscribe(&channel).await;
            debug!(channel = %channel, "Listening for match events");

            let mut received = false;
            while let Some(payload) = stream.next().await {
                received = true;
                self.handle_event(&hub, &topic, &payload);
            }

            if received {
                delay = Duration::from_secs(1);
            }
            warn!(channel = %channel, retry_in_ms = delay.as_millis() as u64, "Match event stream ended; resubscribing");
            sleep(delay).await;
            delay = (delay * 2).min(MAX_RESUBSCRIBE_DELAY);
        }
    }

    /// Re-broadcast one event; high-impact kinds also revalidate the match
    /// page in the background.
    pub fn handle_event(&self, hub: &BroadcastHub, topic: &str, payload: &[u8]) {
        let event: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Dropping undecodable match event");
                return;
            }
        };
        let kind = serde_json::from_value::<MatchEventEnvelope>(event.clone())
            .map(|env| env.kind)
            .unwrap_or_default();

        hub.broadcast_to_topic(
            topic,
            &LiveMessage::MatchEvent {
                match_id: topic.to_string(),
                event,
            },
        );

        if self.config.is_high_impact(&kind) && self.revalidator.is_configured() {
            let revalidator = self.revalidator.clone();
            let path = Revalidator::match_path(topic);
            tokio::spawn(async move {
                match revalidator.revalidate(&path).await {
                    Ok(()) => debug!(path = %path, "Revalidated match page"),
                    Err(e) => warn!(path = %path, error = %e, "Revalidation failed"),
                }
            });
        }
    }

    async fn run_odds_poller(self, hub: BroadcastHub, topic: String) {
        let mut watch = OddsWatch::default();
        let mut ticker = interval(self.config.odds_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.poll_odds(&hub, &topic, &mut watch).await;
        }
    }

    /// One odds poll. Returns the value bets newly announced, if any.
    pub async fn poll_odds(&self, hub: &BroadcastHub, topic: &str, watch: &mut OddsWatch) -> Vec<ValueBet> {
        let book = match tokio::time::timeout(ODDS_CALL_TIMEOUT, self.repository.latest_odds(topic)).await {
            Ok(Ok(Some(book))) if !book.is_empty() => book,
            Ok(Ok(_)) => return Vec::new(),
            Ok(Err(e)) => {
                warn!(topic = %topic, error = %e, "Odds lookup failed");
                return Vec::new();
            }
            Err(_) => {
                warn!(topic = %topic, "Odds lookup timed out");
                return Vec::new();
            }
        };

        if !watch.observe(&book) {
            return Vec::new();
        }

        self.cache
            .set(&odds_key(topic), &book, Some(ODDS_SNAPSHOT_TTL))
            .await;
        hub.broadcast_to_topic(
            topic,
            &LiveMessage::OddsUpdate {
                match_id: topic.to_string(),
                odds: book.clone(),
            },
        );

        let bets = self.orchestrator.edges_for(topic, &book).await;
        let fresh = watch.newly_crossed(bets);
        if !fresh.is_empty() {
            info!(topic = %topic, count = fresh.len(), "Edge alert");
            hub.broadcast_to_topic(
                topic,
                &LiveMessage::EdgeAlert {
                    match_id: topic.to_string(),
                    value_bets: fresh.clone(),
                    detected_at: Utc::now(),
                },
            );
        }
        fresh
    }

    async fn run_metric_poller(self, hub: BroadcastHub, topic: String) {
        let mut last: Option<[f64; 3]> = None;
        let mut ticker = interval(self.config.metric_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.poll_metrics(&hub, &topic, &mut last).await;
        }
    }

    /// Broadcast calibrated probabilities when they moved since the last poll.
    pub async fn poll_metrics(&self, hub: &BroadcastHub, topic: &str, last: &mut Option<[f64; 3]>) -> bool {
        let Some(record) = self.orchestrator.cached_latest(topic).await else {
            return false;
        };
        let probs = record.calibrated_probabilities;
        if last.as_ref() == Some(&probs) {
            return false;
        }
        *last = Some(probs);

        let at = Utc::now();
        for outcome in Outcome::ALL {
            hub.broadcast_to_topic(
                topic,
                &LiveMessage::LiveMetric {
                    match_id: topic.to_string(),
                    name: format!("probability_{}", outcome),
                    value: probs[outcome.index()],
                    at,
                },
            );
        }
        true
    }
}

impl TopicDriver for LiveLoops {
    fn spawn_loops(&self, hub: &BroadcastHub, topic: &str) -> Vec<JoinHandle<()>> {
        let topic = topic.to_string();
        info!(topic = %topic, "Starting topic loops");
        vec![
            tokio::spawn(self.clone().run_event_listener(hub.clone(), topic.clone())),
            tokio::spawn(self.clone().run_odds_poller(hub.clone(), topic.clone())),
            tokio::spawn(self.clone().run_metric_poller(hub.clone(), topic)),
        ]
    }
}

/// Per-topic odds state: the last book broadcast and the value bets already
/// announced, by (outcome, bookmaker)
#[derive(Debug, Default)]
pub struct OddsWatch {
    last_book: Option<OddsBook>,
    announced: HashSet<(Outcome, String)>,
}

impl OddsWatch {
    /// Remember `book` as the latest seen. False when its prices match the
    /// previous book.
    pub fn observe(&mut self, book: &OddsBook) -> bool {
        if self
            .last_book
            .as_ref()
            .map(|previous| previous.same_prices(book))
            .unwrap_or(false)
        {
            return false;
        }
        self.last_book = Some(book.clone());
        true
    }

    /// Bets not announced before. Pairs missing from `bets` are forgotten so
    /// a later re-cross alerts again.
    pub fn newly_crossed(&mut self, bets: Vec<ValueBet>) -> Vec<ValueBet> {
        let current: HashSet<(Outcome, String)> = bets
            .iter()
            .map(|b| (b.outcome, b.bookmaker.clone()))
            .collect();
        let fresh = bets
            .into_iter()
            .filter(|b| !self.announced.contains(&(b.outcome, b.bookmaker.clone())))
            .collect();
        self.announced = current;
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationTracker;
    use crate::config::{CacheConfig, CalibrationConfig, PredictionConfig};
    use crate::prediction::collaborators::{Inference, ModelError, Predictor, Unconfigured};
    use crate::prediction::models::{FeatureMap, MarketOdds};
    use crate::cache::resilient::test_support::{cache_with, FlakyRemote};
    use crate::cache::{InProcessStore, RemoteStore};
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed;

    #[async_trait]
    impl Predictor for Fixed {
        async fn infer(&self, _segment: &str, _features: &FeatureMap) -> Result<Inference, ModelError> {
            Ok(Inference {
                probabilities: [0.55, 0.25, 0.20],
                model_version: "v1".into(),
            })
        }
    }

    #[derive(Default)]
    struct ScriptedOdds {
        book: Mutex<Option<OddsBook>>,
    }

    #[async_trait]
    impl Repository for ScriptedOdds {
        async fn latest_odds(&self, _match_id: &str) -> anyhow::Result<Option<OddsBook>> {
            Ok(self.book.lock().clone())
        }
    }

    fn book(home: f64) -> OddsBook {
        OddsBook::new(
            "m1",
            vec![MarketOdds {
                bookmaker: "alpha".into(),
                prices: [home, 3.4, 4.5],
            }],
        )
    }

    fn setup(repo: Arc<ScriptedOdds>) -> (LiveLoops, Arc<PredictionOrchestrator>) {
        let cache = Arc::new(ResilientCache::local_only(&CacheConfig::default()));
        let revalidator = Revalidator::new(None, "", Duration::from_secs(1)).unwrap();
        build(cache, repo, revalidator)
    }

    fn build(
        cache: Arc<ResilientCache>,
        repo: Arc<ScriptedOdds>,
        revalidator: Revalidator,
    ) -> (LiveLoops, Arc<PredictionOrchestrator>) {
        let calibration = Arc::new(CalibrationTracker::new(cache.clone(), CalibrationConfig::default()));
        let orchestrator = Arc::new(PredictionOrchestrator::new(
            cache.clone(),
            calibration,
            Arc::new(Fixed),
            Arc::new(Unconfigured),
            &PredictionConfig::default(),
        ));
        let loops = LiveLoops::new(
            cache,
            orchestrator.clone(),
            repo,
            revalidator,
            LiveConfig::default(),
        );
        (loops, orchestrator)
    }

    fn frame_types(rx: &mut tokio::sync::mpsc::Receiver<Arc<str>>) -> Vec<String> {
        let mut types = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
            types.push(v["type"].as_str().unwrap_or_default().to_string());
        }
        types
    }

    #[test]
    fn test_odds_watch_forgets_uncrossed() {
        let bet = |bookmaker: &str| ValueBet {
            outcome: Outcome::Home,
            edge_percent: 7.0,
            implied_probability: 0.48,
            fair_probability: 0.55,
            kelly_stake_percent: 1.7,
            bookmaker: bookmaker.into(),
            decimal_odds: 2.1,
        };
        let mut watch = OddsWatch::default();
        assert_eq!(watch.newly_crossed(vec![bet("alpha")]).len(), 1);
        assert!(watch.newly_crossed(vec![bet("alpha")]).is_empty());
        assert_eq!(watch.newly_crossed(vec![bet("alpha"), bet("beta")]).len(), 1);
        assert!(watch.newly_crossed(Vec::new()).is_empty());
        assert_eq!(watch.newly_crossed(vec![bet("alpha")]).len(), 1);
    }

    #[tokio::test]
    async fn test_poll_odds_broadcasts_changes_and_new_edges() {
        let repo = Arc::new(ScriptedOdds::default());
        let (loops, orchestrator) = setup(repo.clone());
        let hub = BroadcastHub::new(64);
        let (id, mut rx) = hub.connect();
        hub.subscribe(id, "m1").unwrap();
        let mut watch = OddsWatch::default();

        // No odds yet
        assert!(loops.poll_odds(&hub, "m1", &mut watch).await.is_empty());
        assert!(frame_types(&mut rx).is_empty());

        orchestrator
            .predict(None, "m1", &FeatureMap::new(), None)
            .await
            .unwrap();

        // Below threshold: update only
        *repo.book.lock() = Some(book(1.80));
        assert!(loops.poll_odds(&hub, "m1", &mut watch).await.is_empty());
        assert_eq!(frame_types(&mut rx), vec!["odds_update"]);

        // Unchanged prices: nothing
        loops.poll_odds(&hub, "m1", &mut watch).await;
        assert!(frame_types(&mut rx).is_empty());

        // Crosses the threshold: update plus alert
        *repo.book.lock() = Some(book(2.10));
        assert_eq!(loops.poll_odds(&hub, "m1", &mut watch).await.len(), 1);
        assert_eq!(frame_types(&mut rx), vec!["odds_update", "edge_alert"]);

        // Still crossed at a different price: no second alert
        *repo.book.lock() = Some(book(2.20));
        assert!(loops.poll_odds(&hub, "m1", &mut watch).await.is_empty());
        assert_eq!(frame_types(&mut rx), vec!["odds_update"]);
    }

    #[tokio::test]
    async fn test_poll_metrics_only_on_change() {
        let (loops, orchestrator) = setup(Arc::new(ScriptedOdds::default()));
        let hub = BroadcastHub::new(64);
        let (id, mut rx) = hub.connect();
        hub.subscribe(id, "m1").unwrap();
        let mut last = None;

        assert!(!loops.poll_metrics(&hub, "m1", &mut last).await);
        orchestrator
            .predict(None, "m1", &FeatureMap::new(), None)
            .await
            .unwrap();
        assert!(loops.poll_metrics(&hub, "m1", &mut last).await);
        assert_eq!(frame_types(&mut rx), vec!["live_metric"; 3]);
        assert!(!loops.poll_metrics(&hub, "m1", &mut last).await);
    }

    #[tokio::test]
    async fn test_handle_event_rebroadcasts() {
        let (loops, _) = setup(Arc::new(ScriptedOdds::default()));
        let hub = BroadcastHub::new(64);
        let (id, mut rx) = hub.connect();
        hub.subscribe(id, "m1").unwrap();

        loops.handle_event(&hub, "m1", br#"{"kind":"goal","minute":63}"#);
        loops.handle_event(&hub, "m1", b"garbage");

        let frame = rx.recv().await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["type"], "match_event");
        assert_eq!(v["data"]["event"]["minute"], 63);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_event_listener_consumes_channel() {
        let (loops, _) = setup(Arc::new(ScriptedOdds::default()));
        let cache = loops.cache.clone();
        let hub = BroadcastHub::new(64);
        let (id, mut rx) = hub.connect();
        hub.subscribe(id, "m1").unwrap();

        let task = tokio::spawn(loops.clone().run_event_listener(hub.clone(), "m1".into()));
        // Let the listener subscribe
        tokio::time::sleep(Duration::from_millis(50)).await;

        cache
            .publish(&event_channel("m1"), &serde_json::json!({"kind": "corner"}))
            .await;
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(frame.contains("corner"));
        task.abort();
    }

    #[tokio::test]
    async fn test_event_listener_joins_shared_channel_after_outage() {
        let remote = Arc::new(FlakyRemote::failing());
        let cache = Arc::new(cache_with(remote.clone(), Duration::from_millis(50)));
        let revalidator = Revalidator::new(None, "", Duration::from_secs(1)).unwrap();
        let (loops, _) = build(cache, Arc::new(ScriptedOdds::default()), revalidator);
        let hub = BroadcastHub::new(64);
        let (id, mut rx) = hub.connect();
        hub.subscribe(id, "m1").unwrap();

        // Starts while the shared store is down
        let task = tokio::spawn(loops.clone().run_event_listener(hub.clone(), "m1".into()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        remote.set_failing(false);

        let frame = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                // Another instance publishing on the shared channel
                remote
                    .inner
                    .publish(&event_channel("m1"), br#"{"kind":"corner"}"#)
                    .await
                    .unwrap();
                if let Ok(Some(frame)) =
                    tokio::time::timeout(Duration::from_millis(20), rx.recv()).await
                {
                    return frame;
                }
            }
        })
        .await
        .unwrap();
        assert!(frame.contains("corner"));
        task.abort();
    }

    #[tokio::test]
    async fn test_every_instance_broadcasts_shared_odds() {
        let shared = Arc::new(InProcessStore::new());
        let repo = Arc::new(ScriptedOdds::default());
        *repo.book.lock() = Some(book(1.80));

        let mut clients = Vec::new();
        for _ in 0..2 {
            let cache = Arc::new(ResilientCache::new(
                Some(shared.clone()),
                &CacheConfig::default(),
            ));
            let revalidator = Revalidator::new(None, "", Duration::from_secs(1)).unwrap();
            let (loops, _) = build(cache, repo.clone(), revalidator);
            let hub = BroadcastHub::new(64);
            let (id, rx) = hub.connect();
            hub.subscribe(id, "m1").unwrap();
            clients.push((loops, hub, rx));
        }

        for (loops, hub, rx) in clients.iter_mut() {
            let mut watch = OddsWatch::default();
            loops.poll_odds(hub, "m1", &mut watch).await;
            assert_eq!(frame_types(rx), vec!["odds_update"]);
        }

        // A topic that comes back while the snapshot is still cached
        let (loops, hub, rx) = &mut clients[0];
        let mut watch = OddsWatch::default();
        loops.poll_odds(hub, "m1", &mut watch).await;
        assert_eq!(frame_types(rx), vec!["odds_update"]);
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_high_impact_event_revalidates_match_page() {
        let (tx, mut posted) = tokio::sync::mpsc::unbounded_channel::<serde_json::Value>();
        let app = Router::new().route(
            "/revalidate",
            post(move |Json(body): Json<serde_json::Value>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(body);
                    StatusCode::OK
                }
            }),
        );
        let base = serve(app).await;
        let revalidator = Revalidator::new(Some(&base), "s3cret", Duration::from_secs(2)).unwrap();
        let cache = Arc::new(ResilientCache::local_only(&CacheConfig::default()));
        let (loops, _) = build(cache, Arc::new(ScriptedOdds::default()), revalidator);
        let hub = BroadcastHub::new(64);
        let (id, mut rx) = hub.connect();
        hub.subscribe(id, "m1").unwrap();

        loops.handle_event(&hub, "m1", br#"{"kind":"goal","minute":12}"#);
        loops.handle_event(&hub, "m1", br#"{"kind":"corner","minute":13}"#);
        assert_eq!(frame_types(&mut rx), vec!["match_event", "match_event"]);

        let body = tokio::time::timeout(Duration::from_secs(2), posted.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body["path"], "/matches/m1");
        assert_eq!(body["secret"], "s3cret");

        // Only the goal triggers a revalidation
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(posted.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failing_revalidation_does_not_hold_broadcasts() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/revalidate",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }),
        );
        let base = serve(app).await;
        let revalidator = Revalidator::new(Some(&base), "s", Duration::from_secs(2)).unwrap();
        let cache = Arc::new(ResilientCache::local_only(&CacheConfig::default()));
        let (loops, _) = build(cache, Arc::new(ScriptedOdds::default()), revalidator);
        let hub = BroadcastHub::new(64);
        let (id, mut rx) = hub.connect();
        hub.subscribe(id, "m1").unwrap();

        loops.handle_event(&hub, "m1", br#"{"kind":"goal"}"#);
        assert_eq!(frame_types(&mut rx), vec!["match_event"]);

        // Endpoint is hit and is still stalling when the next goal arrives
        tokio::time::timeout(Duration::from_secs(2), async {
            while hits.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        loops.handle_event(&hub, "m1", br#"{"kind":"goal"}"#);
        assert_eq!(frame_types(&mut rx), vec!["match_event"]);

        // Both calls end in HTTP 500; the topic keeps working
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        loops.handle_event(&hub, "m1", br#"{"kind":"card"}"#);
        assert_eq!(frame_types(&mut rx), vec!["match_event"]);
    }
}
