//! Prediction orchestrator
//!
//! Routes a request to the segment's predictor, calibrates the output,
//! derives value bets from supplied odds and caches the whole record. A
//! predictor failure never writes to the cache.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::collaborators::{FeatureError, FeatureProvider, Inference, ModelError, Predictor};
use super::kelly::{find_value_bets, StakingParams};
use super::models::{normalize, FeatureMap, OddsBook, Outcome, PredictionRecord, ValueBet};
use crate::cache::ResilientCache;
use crate::calibration::{CalibrationError, CalibrationTracker};
use crate::config::PredictionConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum PredictionError {
    /// Predictor failed, timed out or returned garbage
    PredictionUnavailable(String),
    FeaturesNotFound(String),
    InvalidRequest(String),
}

impl std::fmt::Display for PredictionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PredictionUnavailable(reason) => write!(f, "prediction unavailable: {}", reason),
            Self::FeaturesNotFound(match_id) => write!(f, "features not found for match {}", match_id),
            Self::InvalidRequest(reason) => write!(f, "invalid request: {}", reason),
        }
    }
}

impl std::error::Error for PredictionError {}

impl From<ModelError> for PredictionError {
    fn from(e: ModelError) -> Self {
        Self::PredictionUnavailable(e.to_string())
    }
}

impl From<FeatureError> for PredictionError {
    fn from(e: FeatureError) -> Self {
        match e {
            FeatureError::FeaturesNotFound { match_id } => Self::FeaturesNotFound(match_id),
            other => Self::PredictionUnavailable(other.to_string()),
        }
    }
}

pub fn record_key(segment: &str, match_id: &str) -> String {
    format!("prediction:{}:{}", segment, match_id)
}

pub fn latest_key(match_id: &str) -> String {
    format!("prediction:latest:{}", match_id)
}

pub struct PredictionOrchestrator {
    cache: Arc<ResilientCache>,
    calibration: Arc<CalibrationTracker>,
    predictor: Arc<dyn Predictor>,
    features: Arc<dyn FeatureProvider>,
    staking: StakingParams,
    default_segment: String,
    record_ttl: Duration,
    predictor_timeout: Duration,
}

impl PredictionOrchestrator {
    pub fn new(
        cache: Arc<ResilientCache>,
        calibration: Arc<CalibrationTracker>,
        predictor: Arc<dyn Predictor>,
        features: Arc<dyn FeatureProvider>,
        config: &PredictionConfig,
    ) -> Self {
        Self {
            cache,
            calibration,
            predictor,
            features,
            staking: StakingParams::from(config),
            default_segment: config.default_segment.clone(),
            record_ttl: config.record_ttl(),
            predictor_timeout: config.predictor_timeout(),
        }
    }

    pub fn default_segment(&self) -> &str {
        &self.default_segment
    }

    pub fn staking(&self) -> &StakingParams {
        &self.staking
    }

    /// Missing or blank segment ids map to the default segment.
    pub fn resolve_segment<'a>(&'a self, segment: Option<&'a str>) -> &'a str {
        match segment.map(str::trim) {
            Some(s) if !s.is_empty() => s,
            _ => &self.default_segment,
        }
    }

    /// Serve a fresh cached record or compute, calibrate and cache a new one.
    pub async fn predict(
        &self,
        segment: Option<&str>,
        match_id: &str,
        features: &FeatureMap,
        odds: Option<&OddsBook>,
    ) -> Result<PredictionRecord, PredictionError> {
        if match_id.trim().is_empty() {
            return Err(PredictionError::InvalidRequest("match_id is empty".into()));
        }
        let segment = self.resolve_segment(segment);
        let key = record_key(segment, match_id);

        if let Some(mut record) = self.cache.get::<PredictionRecord>(&key).await {
            debug!(segment = %segment, match_id = %match_id, "Serving cached prediction");
            // Edges are only current for the odds supplied with this request
            record.value_bets = match odds {
                Some(odds) => find_value_bets(&record.calibrated_probabilities, odds, &self.staking),
                None => Vec::new(),
            };
            return Ok(record);
        }

        let (model_segment, inference) = self.infer(segment, features).await?;
        let raw = normalize(&inference.probabilities).ok_or_else(|| {
            PredictionError::PredictionUnavailable(format!(
                "predictor returned unusable probabilities {:?}",
                inference.probabilities
            ))
        })?;

        let calibrated = self.calibration.apply(model_segment, raw).await;
        let value_bets = odds
            .map(|o| find_value_bets(&calibrated, o, &self.staking))
            .unwrap_or_default();

        let record = PredictionRecord {
            match_id: match_id.to_string(),
            segment_id: model_segment.to_string(),
            raw_probabilities: raw,
            calibrated_probabilities: calibrated,
            model_version: inference.model_version,
            generated_at: Utc::now(),
            value_bets,
        };

        self.cache.set(&key, &record, Some(self.record_ttl)).await;
        self.cache
            .set(&latest_key(match_id), &record, Some(self.record_ttl))
            .await;

        info!(
            segment = %record.segment_id,
            match_id = %match_id,
            model_version = %record.model_version,
            value_bets = record.value_bets.len(),
            "Prediction generated"
        );
        Ok(record)
    }

    /// Predictor call bounded by the configured timeout. A segment without a
    /// model falls back to the default segment once.
    async fn infer<'a>(
        &'a self,
        segment: &'a str,
        features: &FeatureMap,
    ) -> Result<(&'a str, Inference), PredictionError> {
        match self.infer_once(segment, features).await {
            Err(ModelError::ModelUnavailable { .. }) if segment != self.default_segment => {
                debug!(segment = %segment, fallback = %self.default_segment, "No model for segment; using default");
                let inference = self
                    .infer_once(&self.default_segment, features)
                    .await
                    .map_err(|e| self.unavailable(&self.default_segment, e))?;
                Ok((&self.default_segment, inference))
            }
            Err(e) => Err(self.unavailable(segment, e)),
            Ok(inference) => Ok((segment, inference)),
        }
    }

    async fn infer_once(
        &self,
        segment: &str,
        features: &FeatureMap,
    ) -> Result<Inference, ModelError> {
        match tokio::time::timeout(self.predictor_timeout, self.predictor.infer(segment, features)).await {
            Ok(result) => result,
            Err(_) => Err(ModelError::Timeout(self.predictor_timeout)),
        }
    }

    fn unavailable(&self, segment: &str, e: ModelError) -> PredictionError {
        warn!(segment = %segment, error = %e, "Predictor failed");
        metrics::counter!("edgeline_prediction_failures_total", 1);
        PredictionError::from(e)
    }

    /// Pull features for the match, then `predict`.
    pub async fn predict_match(
        &self,
        segment: Option<&str>,
        match_id: &str,
        odds: Option<&OddsBook>,
    ) -> Result<PredictionRecord, PredictionError> {
        let features = self.features.get_features(match_id).await?;
        self.predict(segment, match_id, &features, odds).await
    }

    /// Feed the result back into calibration and invalidate the match's
    /// cached records. Returns whether a prediction was found to learn from.
    pub async fn record_result(
        &self,
        segment: Option<&str>,
        match_id: &str,
        outcome: Outcome,
    ) -> Result<bool, CalibrationError> {
        let segment = self.resolve_segment(segment);
        let key = record_key(segment, match_id);

        let record = match self.cache.get::<PredictionRecord>(&key).await {
            Some(record) => Some(record),
            None => self.cached_latest_in_segment(match_id, segment).await,
        };

        let learned = match &record {
            Some(record) => self
                .calibration
                .record_outcome(&record.segment_id, record.raw_probabilities, outcome)
                .await
                .map(|_| true),
            None => {
                debug!(segment = %segment, match_id = %match_id, "No cached prediction to learn from");
                Ok(false)
            }
        };

        self.cache.delete(&key).await;
        self.cache.delete(&latest_key(match_id)).await;
        learned
    }

    async fn cached_latest_in_segment(&self, match_id: &str, segment: &str) -> Option<PredictionRecord> {
        self.cached_latest(match_id)
            .await
            .filter(|r| r.segment_id == segment)
    }

    /// Newest cached record for a match, whatever its segment.
    pub async fn cached_latest(&self, match_id: &str) -> Option<PredictionRecord> {
        self.cache.get(&latest_key(match_id)).await
    }

    /// Value bets for fresh odds against the newest cached record.
    pub async fn edges_for(&self, match_id: &str, odds: &OddsBook) -> Vec<ValueBet> {
        match self.cached_latest(match_id).await {
            Some(record) => find_value_bets(&record.calibrated_probabilities, odds, &self.staking),
            None => Vec::new(),
        }
    }
}
