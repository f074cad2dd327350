//! Streaming calibration tracker
//!
//! Keeps a bounded window of (predicted, observed) samples per segment and
//! refits one isotonic curve per outcome from it. Curves are swapped in
//! whole, so `apply` never sees a half-built mapping. Windows and curves are
//! persisted through the resilient cache and hydrated lazily per segment.

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use super::isotonic::{fit_isotonic, CalibrationCurve};
use crate::cache::ResilientCache;
use crate::config::CalibrationConfig;
use crate::prediction::models::{normalize, validate_probabilities, Outcome, Probabilities};

/// One observed result against the probabilities predicted for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub segment_id: String,
    pub predicted: Probabilities,
    pub outcome: Outcome,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationError {
    InvalidProbabilities(String),
    InsufficientSamples { have: usize, need: usize },
    RefitFailed { segment: String, reason: String },
}

impl std::fmt::Display for CalibrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidProbabilities(reason) => write!(f, "invalid probabilities: {}", reason),
            Self::InsufficientSamples { have, need } => {
                write!(f, "insufficient samples: {} of {}", have, need)
            }
            Self::RefitFailed { segment, reason } => {
                write!(f, "refit failed for segment {}: {}", segment, reason)
            }
        }
    }
}

impl std::error::Error for CalibrationError {}

pub fn window_key(segment: &str) -> String {
    format!("calibration:window:{}", segment)
}

pub fn curve_key(segment: &str, outcome: Outcome) -> String {
    format!("calibration:curve:{}:{}", segment, outcome.index())
}

struct SegmentState {
    /// Serializes appends and refits within the segment
    window: Mutex<VecDeque<CalibrationSample>>,
    curves: [ArcSwapOption<CalibrationCurve>; 3],
    hydrated: OnceCell<()>,
}

impl SegmentState {
    fn new() -> Self {
        Self {
            window: Mutex::new(VecDeque::new()),
            curves: [
                ArcSwapOption::empty(),
                ArcSwapOption::empty(),
                ArcSwapOption::empty(),
            ],
            hydrated: OnceCell::new(),
        }
    }
}

pub struct CalibrationTracker {
    cache: Arc<ResilientCache>,
    config: CalibrationConfig,
    segments: RwLock<HashMap<String, Arc<SegmentState>>>,
}

impl CalibrationTracker {
    pub fn new(cache: Arc<ResilientCache>, config: CalibrationConfig) -> Self {
        Self {
            cache,
            config,
            segments: RwLock::new(HashMap::new()),
        }
    }

    /// Segment state, hydrated from the cache on first touch.
    async fn segment(&self, segment: &str) -> Arc<SegmentState> {
        let state = {
            let existing = self.segments.read().get(segment).cloned();
            match existing {
                Some(state) => state,
                None => self
                    .segments
                    .write()
                    .entry(segment.to_string())
                    .or_insert_with(|| Arc::new(SegmentState::new()))
                    .clone(),
            }
        };

        state
            .hydrated
            .get_or_init(|| self.hydrate(segment, &state))
            .await;
        state
    }

    /// Segment state for read-only lookups. Segments never recorded here
    /// and with nothing persisted in the cache are not tracked.
    async fn known_segment(&self, segment: &str) -> Option<Arc<SegmentState>> {
        let existing = self.segments.read().get(segment).cloned();
        if let Some(state) = existing {
            state
                .hydrated
                .get_or_init(|| self.hydrate(segment, &state))
                .await;
            return Some(state);
        }

        if self.is_persisted(segment).await {
            Some(self.segment(segment).await)
        } else {
            None
        }
    }

    async fn is_persisted(&self, segment: &str) -> bool {
        if self.cache.exists(&window_key(segment)).await {
            return true;
        }
        for outcome in Outcome::ALL {
            if self.cache.exists(&curve_key(segment, outcome)).await {
                return true;
            }
        }
        false
    }

    /// Number of segments held in memory.
    pub fn tracked_segments(&self) -> usize {
        self.segments.read().len()
    }

    async fn hydrate(&self, segment: &str, state: &SegmentState) {
        let samples: Option<Vec<CalibrationSample>> = self.cache.get(&window_key(segment)).await;
        if let Some(samples) = samples {
            let mut window = state.window.lock().await;
            if window.is_empty() {
                let skip = samples.len().saturating_sub(self.config.window_capacity);
                window.extend(samples.into_iter().skip(skip));
            }
        }

        let mut restored = 0usize;
        for outcome in Outcome::ALL {
            let curve: Option<CalibrationCurve> =
                self.cache.get(&curve_key(segment, outcome)).await;
            if let Some(curve) = curve.filter(|c| c.is_monotonic() && !c.knots.is_empty()) {
                state.curves[outcome.index()].store(Some(Arc::new(curve)));
                restored += 1;
            }
        }

        let window = state.window.lock().await.len();
        debug!(
            segment = %segment,
            window,
            curves = restored,
            "Calibration segment hydrated"
        );
    }

    /// Append an observed outcome. Refits once the window holds enough
    /// samples; a failed refit keeps the previous curves. Returns the
    /// window length.
    pub async fn record_outcome(
        &self,
        segment: &str,
        predicted: Probabilities,
        outcome: Outcome,
    ) -> Result<usize, CalibrationError> {
        validate_probabilities(&predicted).map_err(CalibrationError::InvalidProbabilities)?;

        let state = self.segment(segment).await;
        let mut window = state.window.lock().await;

        window.push_back(CalibrationSample {
            segment_id: segment.to_string(),
            predicted,
            outcome,
            observed_at: Utc::now(),
        });
        while window.len() > self.config.window_capacity.max(1) {
            window.pop_front();
        }

        let snapshot: Vec<CalibrationSample> = window.iter().cloned().collect();
        self.cache
            .set(&window_key(segment), &snapshot, Some(self.config.persist_ttl()))
            .await;

        let len = snapshot.len();
        if len >= self.config.min_samples {
            if let Err(e) = self.refit_samples(segment, &state, &snapshot).await {
                warn!(segment = %segment, error = %e, "Calibration refit failed; keeping previous curves");
            }
        }
        Ok(len)
    }

    /// Refit all three curves from the current window. Returns how many
    /// curves were replaced.
    pub async fn refit(&self, segment: &str) -> Result<usize, CalibrationError> {
        let state = self.segment(segment).await;
        let window = state.window.lock().await;
        let snapshot: Vec<CalibrationSample> = window.iter().cloned().collect();
        self.refit_samples(segment, &state, &snapshot).await
    }

    async fn refit_samples(
        &self,
        segment: &str,
        state: &SegmentState,
        samples: &[CalibrationSample],
    ) -> Result<usize, CalibrationError> {
        if samples.len() < self.config.min_samples {
            return Err(CalibrationError::InsufficientSamples {
                have: samples.len(),
                need: self.config.min_samples,
            });
        }

        let mut updated = 0usize;
        let mut failures = Vec::new();

        for outcome in Outcome::ALL {
            let idx = outcome.index();
            let points: Vec<(f64, f64)> = samples
                .iter()
                .map(|s| (s.predicted[idx], if s.outcome == outcome { 1.0 } else { 0.0 }))
                .collect();

            match fit_isotonic(&points, self.config.min_distinct_predictions) {
                Ok(knots) => {
                    let curve = CalibrationCurve {
                        segment_id: segment.to_string(),
                        outcome,
                        knots,
                        sample_count: samples.len(),
                        updated_at: Utc::now(),
                    };
                    self.cache
                        .set(&curve_key(segment, outcome), &curve, Some(self.config.persist_ttl()))
                        .await;
                    state.curves[idx].store(Some(Arc::new(curve)));
                    updated += 1;
                }
                Err(e) => failures.push(format!("{}: {}", outcome, e)),
            }
        }

        let result = if updated > 0 { "ok" } else { "failed" };
        metrics::counter!("edgeline_calibration_refits_total", 1, "result" => result);

        if updated == 0 {
            return Err(CalibrationError::RefitFailed {
                segment: segment.to_string(),
                reason: failures.join("; "),
            });
        }
        if !failures.is_empty() {
            warn!(segment = %segment, failures = %failures.join("; "), "Partial calibration refit");
        }
        info!(segment = %segment, samples = samples.len(), curves = updated, "Calibration refit");
        Ok(updated)
    }

    /// Map raw probabilities through the segment's curves and renormalize.
    /// Outcomes without a curve keep their raw value; a segment with no
    /// curves at all returns `raw` unchanged.
    pub async fn apply(&self, segment: &str, raw: Probabilities) -> Probabilities {
        let Some(state) = self.known_segment(segment).await else {
            return raw;
        };
        let curves: Vec<Option<Arc<CalibrationCurve>>> =
            state.curves.iter().map(|c| c.load_full()).collect();

        if curves.iter().all(Option::is_none) {
            return raw;
        }

        let mut mapped = raw;
        for (idx, curve) in curves.iter().enumerate() {
            if let Some(curve) = curve {
                mapped[idx] = curve.map(raw[idx]);
            }
        }

        normalize(&mapped).unwrap_or(raw)
    }

    /// Current curves for a segment, in outcome order.
    pub async fn curves(&self, segment: &str) -> Vec<CalibrationCurve> {
        let Some(state) = self.known_segment(segment).await else {
            return Vec::new();
        };
        state
            .curves
            .iter()
            .filter_map(|c| c.load_full())
            .map(|c| c.as_ref().clone())
            .collect()
    }

    pub async fn window_len(&self, segment: &str) -> usize {
        match self.known_segment(segment).await {
            Some(state) => {
                let len = state.window.lock().await.len();
                len
            }
            None => 0,
        }
    }
}
