//! Resilient cache
//!
//! Fronts the shared remote store with a circuit breaker, a bounded local
//! fallback store and tagged serialization. Cache trouble is absorbed here:
//! callers only ever see `Option`/`bool`/counts, never an error.

use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::circuit::{CircuitBreaker, CircuitState};
use super::codec;
use super::local::LocalStore;
use super::remote::{receiver_stream, MessageStream, RemoteError, RemoteStore};
use crate::config::CacheConfig;

const LOCAL_BUS_CAPACITY: usize = 1024;
const MIN_RESUBSCRIBE_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time view of cache health
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub circuit_open: bool,
    pub circuit_state: CircuitState,
    pub circuit_trips: u64,
    pub local_entry_count: usize,
    pub local_evictions: u64,
    pub backend_enabled: bool,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct ResilientCache {
    remote: Option<Arc<dyn RemoteStore>>,
    local: LocalStore,
    breaker: CircuitBreaker,
    op_timeout: Duration,
    stats: CacheStats,
    local_bus: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl ResilientCache {
    pub fn new(remote: Option<Arc<dyn RemoteStore>>, config: &CacheConfig) -> Self {
        Self {
            remote,
            local: LocalStore::new(config.local_max_entries),
            breaker: CircuitBreaker::new(config.circuit_cooldown()),
            op_timeout: config.op_timeout(),
            stats: CacheStats::default(),
            local_bus: Mutex::new(HashMap::new()),
        }
    }

    /// Local store only; the remote backend is disabled.
    pub fn local_only(config: &CacheConfig) -> Self {
        Self::new(None, config)
    }

    pub fn backend_enabled(&self) -> bool {
        self.remote.is_some()
    }

    /// Run one remote operation through the breaker and the per-call timeout.
    /// `None` means the remote was not consulted (disabled or circuit open).
    async fn call_remote<T, F, Fut>(&self, op: &'static str, f: F) -> Option<Result<T, RemoteError>>
    where
        F: FnOnce(Arc<dyn RemoteStore>) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let remote = self.remote.as_ref()?.clone();

        let admission = self.breaker.admit();
        let permit = admission.permit()?;
        if admission.is_probe() {
            debug!(op, "Probing remote cache after cooldown");
        }

        let result = match tokio::time::timeout(self.op_timeout, f(remote)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(self.op_timeout)),
        };

        match &result {
            Ok(_) => self.breaker.record_success(permit),
            Err(e) => {
                self.record_error("remote");
                warn!(op, error = %e, "Remote cache call failed; using local fallback");
                self.breaker.record_failure(&e.to_string());
            }
        }
        Some(result)
    }

    fn record_hit(&self, backend: &'static str) {
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("edgeline_cache_hits_total", 1, "backend" => backend);
    }

    fn record_miss(&self) {
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("edgeline_cache_misses_total", 1);
    }

    fn record_error(&self, kind: &'static str) {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("edgeline_cache_errors_total", 1, "kind" => kind);
    }

    /// Raw payload lookup. The remote answer is authoritative whenever the
    /// remote is reachable; the local store serves only on error/open circuit.
    pub async fn get_raw(&self, key: &str) -> Option<Vec<u8>> {
        let k = key.to_string();
        let remote = self
            .call_remote("get", |r| async move { r.get(&k).await })
            .await;

        match remote {
            Some(Ok(Some(value))) => {
                self.record_hit("remote");
                debug!(key, "cache hit (remote)");
                Some(value)
            }
            Some(Ok(None)) => {
                self.record_miss();
                debug!(key, "cache miss");
                None
            }
            Some(Err(_)) | None => match self.local.get(key) {
                Some(value) => {
                    self.record_hit("local");
                    debug!(key, "cache hit (local)");
                    Some(value)
                }
                None => {
                    self.record_miss();
                    debug!(key, "cache miss (local)");
                    None
                }
            },
        }
    }

    /// Typed lookup. Undecodable payloads count as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get_raw(key).await?;
        match codec::decode(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                self.record_error("decode");
                warn!(key, error = %e, "Cached payload undecodable; treating as miss");
                None
            }
        }
    }

    /// Store a pre-encoded payload. The local store is always written with the
    /// same TTL so local reads stay consistent through a remote outage.
    pub async fn set_raw(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> bool {
        let k = key.to_string();
        let payload = value.clone();
        let remote = self
            .call_remote("set", |r| async move { r.set(&k, &payload, ttl).await })
            .await;

        self.local.set(key, value, ttl);

        // The local store always accepts the write
        if let Some(Err(_)) = remote {
            debug!(key, "remote write failed; value held locally");
        }
        true
    }

    /// Typed store. Returns false only if the value could not be encoded.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        match codec::encode(value) {
            Ok(bytes) => self.set_raw(key, bytes, ttl).await,
            Err(e) => {
                self.record_error("encode");
                warn!(key, error = %e, "Value not cacheable; skipping write");
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        let k = key.to_string();
        let remote = self
            .call_remote("delete", |r| async move { r.delete(&k).await })
            .await;
        let local = self.local.delete(key);

        match remote {
            Some(Ok(removed)) => removed || local,
            Some(Err(_)) | None => local,
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        let k = key.to_string();
        let remote = self
            .call_remote("exists", |r| async move { r.exists(&k).await })
            .await;
        match remote {
            Some(Ok(found)) => found,
            Some(Err(_)) | None => self.local.exists(key),
        }
    }

    /// Delete every key matching a glob pattern on both backends. Returns the
    /// remote count when the remote was reachable, else the local count.
    pub async fn clear_pattern(&self, pattern: &str) -> usize {
        let p = pattern.to_string();
        let remote = self
            .call_remote("clear_pattern", |r| async move {
                let keys = r.scan_pattern(&p).await?;
                let mut removed = 0usize;
                for key in &keys {
                    if r.delete(key).await? {
                        removed += 1;
                    }
                }
                Ok::<usize, RemoteError>(removed)
            })
            .await;

        let local = self.local.clear_pattern(pattern);
        match remote {
            Some(Ok(removed)) => removed,
            Some(Err(_)) | None => local,
        }
    }

    /// True when the remote answers, or when running local-only.
    pub async fn ping(&self) -> bool {
        if self.remote.is_none() {
            return true;
        }
        matches!(
            self.call_remote("ping", |r| async move { r.ping().await })
                .await,
            Some(Ok(()))
        )
    }

    pub fn metrics_snapshot(&self) -> CacheMetrics {
        let circuit_state = self.breaker.state();
        CacheMetrics {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            circuit_open: circuit_state != CircuitState::Closed,
            circuit_state,
            circuit_trips: self.breaker.trips(),
            local_entry_count: self.local.len(),
            local_evictions: self.local.evictions(),
            backend_enabled: self.remote.is_some(),
        }
    }

    fn local_sender(&self, channel: &str) -> broadcast::Sender<Vec<u8>> {
        self.local_bus
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(LOCAL_BUS_CAPACITY).0)
            .clone()
    }

    /// Publish on the shared channel, or on the local bus when the remote
    /// cannot take it. Returns true if either accepted the message.
    pub async fn publish_raw(&self, channel: &str, payload: Vec<u8>) -> bool {
        let c = channel.to_string();
        let body = payload.clone();
        let remote = self
            .call_remote("publish", |r| async move { r.publish(&c, &body).await })
            .await;

        if matches!(remote, Some(Ok(()))) {
            return true;
        }
        // No local listeners is fine
        let _ = self.local_sender(channel).send(payload);
        true
    }

    pub async fn publish<T: Serialize + ?Sized>(&self, channel: &str, message: &T) -> bool {
        match serde_json::to_vec(message) {
            Ok(bytes) => self.publish_raw(channel, bytes).await,
            Err(e) => {
                self.record_error("encode");
                warn!(channel, error = %e, "Message not publishable");
                false
            }
        }
    }

    /// Subscribe to a channel. The stream merges the shared channel with the
    /// local bus and ends when the shared side ends, so the caller can
    /// resubscribe. If the remote cannot be reached the stream starts on the
    /// local bus alone and retries the shared channel once per cooldown,
    /// joining it in place when it answers.
    pub async fn subscribe(self: &Arc<Self>, channel: &str) -> MessageStream {
        let local = receiver_stream(self.local_sender(channel).subscribe());
        if self.remote.is_none() {
            return local;
        }

        let remote = match self.subscribe_remote(channel).await {
            Some(remote_stream) => remote_stream,
            None => self.deferred_remote(channel.to_string()),
        };

        let remote_tagged = remote.map(Some).chain(stream::once(async { None }));
        stream::select(remote_tagged, local.map(Some))
            .take_while(|item| std::future::ready(item.is_some()))
            .filter_map(std::future::ready)
            .boxed()
    }

    async fn subscribe_remote(&self, channel: &str) -> Option<MessageStream> {
        let c = channel.to_string();
        match self
            .call_remote("subscribe", |r| async move { r.subscribe(&c).await })
            .await
        {
            Some(Ok(remote_stream)) => Some(remote_stream),
            Some(Err(_)) | None => None,
        }
    }

    /// Shared channel subscription that waits for the remote to come back.
    /// Ends without items if the cache is dropped first.
    fn deferred_remote(self: &Arc<Self>, channel: String) -> MessageStream {
        let cache = Arc::downgrade(self);
        let retry = self.breaker.cooldown().max(MIN_RESUBSCRIBE_INTERVAL);
        stream::once(async move {
            loop {
                tokio::time::sleep(retry).await;
                let Some(live) = cache.upgrade() else {
                    return None;
                };
                if let Some(remote_stream) = live.subscribe_remote(&channel).await {
                    info!(channel = %channel, "Shared channel reachable again; subscription joined");
                    return Some(remote_stream);
                }
                debug!(channel = %channel, "Shared channel still unreachable; staying on local bus");
            }
        })
        .filter_map(std::future::ready)
        .flatten()
        .boxed()
    }

    /// Periodic expiry sweep of the local store. Returns the task handle.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    return;
                };
                let purged = cache.local.sweep_expired();
                if purged > 0 {
                    debug!(purged, "Swept expired local cache entries");
                }
            }
        })
    }

    /// Log a one-line summary of the cache configuration.
    pub fn log_startup(&self) {
        info!(
            backend_enabled = self.remote.is_some(),
            op_timeout_ms = self.op_timeout.as_millis() as u64,
            cooldown_secs = self.breaker.cooldown().as_secs(),
            "Resilient cache ready"
        );
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::cache::remote::InProcessStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    /// Remote that can be switched into failure mode and counts calls.
    #[derive(Default)]
    pub struct FlakyRemote {
        pub inner: InProcessStore,
        pub failing: AtomicBool,
        pub calls: AtomicU64,
    }

    impl FlakyRemote {
        pub fn failing() -> Self {
            let remote = Self::default();
            remote.failing.store(true, Ordering::SeqCst);
            remote
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }

        fn enter(&self) -> Result<(), RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                Err(RemoteError::Unavailable("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl RemoteStore for FlakyRemote {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
            self.enter()?;
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), RemoteError> {
            self.enter()?;
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<bool, RemoteError> {
            self.enter()?;
            self.inner.delete(key).await
        }

        async fn exists(&self, key: &str) -> Result<bool, RemoteError> {
            self.enter()?;
            self.inner.exists(key).await
        }

        async fn scan_pattern(&self, pattern: &str) -> Result<Vec<String>, RemoteError> {
            self.enter()?;
            self.inner.scan_pattern(pattern).await
        }

        async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), RemoteError> {
            self.enter()?;
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> Result<MessageStream, RemoteError> {
            self.enter()?;
            self.inner.subscribe(channel).await
        }

        async fn ping(&self) -> Result<(), RemoteError> {
            self.enter()
        }
    }

    pub fn cache_with(remote: Arc<FlakyRemote>, cooldown: Duration) -> ResilientCache {
        let config = CacheConfig {
            op_timeout_ms: 200,
            circuit_cooldown_secs: 0,
            ..CacheConfig::default()
        };
        let mut cache = ResilientCache::new(Some(remote), &config);
        cache.breaker = CircuitBreaker::new(cooldown);
        cache
    }
}
