//! Resilient cache behavior through a remote outage

mod common;

use common::SwitchableRemote;
use edgeline_backend::cache::{CircuitState, RemoteStore, ResilientCache};
use edgeline_backend::config::CacheConfig;
use std::sync::Arc;
use std::time::Duration;

fn config(cooldown_secs: u64) -> CacheConfig {
    CacheConfig {
        op_timeout_ms: 500,
        circuit_cooldown_secs: cooldown_secs,
        ..CacheConfig::default()
    }
}

#[tokio::test]
async fn set_then_get_with_healthy_remote() {
    let remote = Arc::new(SwitchableRemote::default());
    let cache = ResilientCache::new(Some(remote.clone()), &config(30));

    assert!(cache.set("x", &1u32, Some(Duration::from_secs(60))).await);
    assert_eq!(cache.get::<u32>("x").await, Some(1));

    // Written through to the shared store
    assert!(remote.exists("x").await.unwrap());
    let metrics = cache.metrics_snapshot();
    assert_eq!(metrics.hits, 1);
    assert!(!metrics.circuit_open);
}

#[tokio::test]
async fn always_failing_remote_serves_local() {
    let remote = Arc::new(SwitchableRemote::default());
    remote.set_failing(true);
    let cache = ResilientCache::new(Some(remote.clone()), &config(30));

    assert!(cache.set("x", &1u32, Some(Duration::from_secs(60))).await);
    assert_eq!(cache.get::<u32>("x").await, Some(1));

    let metrics = cache.metrics_snapshot();
    assert!(metrics.circuit_open);
    assert!(metrics.errors >= 1);
    assert_eq!(metrics.local_entry_count, 1);
}

#[tokio::test]
async fn open_circuit_skips_remote_until_cooldown() {
    let remote = Arc::new(SwitchableRemote::default());
    remote.set_failing(true);
    let cache = ResilientCache::new(Some(remote.clone()), &config(1));

    cache.set("a", &"v", None).await;
    assert_eq!(remote.calls(), 1);
    assert_eq!(cache.metrics_snapshot().circuit_state, CircuitState::Open);

    for _ in 0..10 {
        cache.get::<String>("a").await;
        cache.set("b", &"w", None).await;
    }
    assert_eq!(remote.calls(), 1, "no remote traffic while open");

    // Remote recovers; after the cooldown one probe closes the circuit
    remote.set_failing(false);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    cache.get::<String>("a").await;
    assert_eq!(remote.calls(), 2);
    assert_eq!(cache.metrics_snapshot().circuit_state, CircuitState::Closed);

    cache.get::<String>("a").await;
    assert_eq!(remote.calls(), 3);
}

#[tokio::test]
async fn local_only_cache_pattern_clear() {
    let cache = ResilientCache::local_only(&config(30));
    for id in ["m1", "m2", "m3"] {
        cache.set(&format!("prediction:epl:{}", id), &id, None).await;
    }
    cache.set("odds:latest:m1", &"book", None).await;

    assert_eq!(cache.clear_pattern("prediction:*").await, 3);
    assert!(cache.exists("odds:latest:m1").await);
    assert!(cache.ping().await);
    assert!(!cache.metrics_snapshot().backend_enabled);
}
