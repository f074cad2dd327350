//! External collaborator contracts
//!
//! The orchestrator only sees these traits. HTTP adapters live in `http`;
//! `Unconfigured` stands in when no endpoint is configured.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::models::{FeatureMap, OddsBook, Probabilities};

/// Model output for one feature vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inference {
    pub probabilities: Probabilities,
    pub model_version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    /// No trained artifact for the segment
    ModelUnavailable { segment: String },
    Timeout(Duration),
    InvalidOutput(String),
    Transport(String),
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelUnavailable { segment } => write!(f, "no model for segment {}", segment),
            Self::Timeout(d) => write!(f, "predictor timed out after {}ms", d.as_millis()),
            Self::InvalidOutput(reason) => write!(f, "invalid predictor output: {}", reason),
            Self::Transport(reason) => write!(f, "predictor transport error: {}", reason),
        }
    }
}

impl std::error::Error for ModelError {}

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureError {
    FeaturesNotFound { match_id: String },
    Transport(String),
}

impl std::fmt::Display for FeatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FeaturesNotFound { match_id } => write!(f, "no features for match {}", match_id),
            Self::Transport(reason) => write!(f, "feature provider transport error: {}", reason),
        }
    }
}

impl std::error::Error for FeatureError {}

/// Opaque model: features in, 3-way distribution out
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn infer(&self, segment: &str, features: &FeatureMap) -> Result<Inference, ModelError>;
}

#[async_trait]
pub trait FeatureProvider: Send + Sync {
    async fn get_features(&self, match_id: &str) -> Result<FeatureMap, FeatureError>;
}

/// Match/odds persistence
#[async_trait]
pub trait Repository: Send + Sync {
    async fn latest_odds(&self, match_id: &str) -> anyhow::Result<Option<OddsBook>>;
}

/// Placeholder for collaborators with no configured endpoint
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

#[async_trait]
impl Predictor for Unconfigured {
    async fn infer(&self, segment: &str, _features: &FeatureMap) -> Result<Inference, ModelError> {
        Err(ModelError::ModelUnavailable {
            segment: segment.to_string(),
        })
    }
}

#[async_trait]
impl FeatureProvider for Unconfigured {
    async fn get_features(&self, match_id: &str) -> Result<FeatureMap, FeatureError> {
        Err(FeatureError::FeaturesNotFound {
            match_id: match_id.to_string(),
        })
    }
}

#[async_trait]
impl Repository for Unconfigured {
    async fn latest_odds(&self, _match_id: &str) -> anyhow::Result<Option<OddsBook>> {
        Ok(None)
    }
}
