//! Shared fakes for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use edgeline_backend::cache::{InProcessStore, MessageStream, RemoteError, RemoteStore};
use edgeline_backend::prediction::{
    FeatureError, FeatureMap, FeatureProvider, Inference, ModelError, Predictor,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Remote store that can be switched into failure mode; counts every call.
#[derive(Default)]
pub struct SwitchableRemote {
    inner: InProcessStore,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl SwitchableRemote {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(RemoteError::Unavailable("connection reset".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteStore for SwitchableRemote {
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

/// Predictor with a fixed answer for every segment
pub struct FixedPredictor {
    pub probabilities: [f64; 3],
    pub calls: AtomicU64,
}

impl FixedPredictor {
    pub fn new(probabilities: [f64; 3]) -> Self {
        Self {
            probabilities,
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Predictor for FixedPredictor {
    async fn infer(&self, segment: &str, _features: &FeatureMap) -> Result<Inference, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Inference {
            probabilities: self.probabilities,
            model_version: format!("{}-fixed", segment),
        })
    }
}

/// Features for any match whose id starts with `m`
pub struct PrefixFeatures;

#[async_trait]
impl FeatureProvider for PrefixFeatures {
    async fn get_features(&self, match_id: &str) -> Result<FeatureMap, FeatureError> {
        if match_id.starts_with('m') {
            Ok(FeatureMap::from([("form_home".to_string(), 0.6)]))
        } else {
            Err(FeatureError::FeaturesNotFound {
                match_id: match_id.to_string(),
            })
        }
    }
}
