//! Service configuration
//!
//! TOML file with every field defaulted, plus environment overrides for
//! deployment-specific endpoints and secrets.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub calibration: CalibrationConfig,

    #[serde(default)]
    pub prediction: PredictionConfig,

    #[serde(default)]
    pub live: LiveConfig,
}

impl ServiceConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from `EDGELINE_CONFIG` (or `edgeline.toml`), then apply env overrides.
    pub fn from_env() -> Self {
        let path =
            std::env::var("EDGELINE_CONFIG").unwrap_or_else(|_| "edgeline.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default service config ({}): {}", path, e);
            Self::default()
        });
        config.apply_env_overrides();
        config
    }

    /// Environment variables win over file values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_string("BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = env_string("REDIS_URL") {
            self.cache.remote_url = Some(v);
        }
        if let Some(v) = env_string("REVALIDATE_URL") {
            self.live.revalidate_url = Some(v);
        }
        if let Some(v) = env_string("REVALIDATE_SECRET") {
            self.live.revalidate_secret = Some(v);
        }
        if let Some(v) = env_string("PREDICTOR_URL") {
            self.server.predictor_url = Some(v);
        }
        if let Some(v) = env_string("FEATURES_URL") {
            self.server.features_url = Some(v);
        }
        if let Some(v) = env_string("ODDS_URL") {
            self.server.odds_url = Some(v);
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// HTTP listener and collaborator endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Model-serving endpoint implementing `Predictor`
    #[serde(default)]
    pub predictor_url: Option<String>,

    /// Feature service implementing `FeatureProvider`
    #[serde(default)]
    pub features_url: Option<String>,

    /// Odds service implementing `Repository`
    #[serde(default)]
    pub odds_url: Option<String>,

    /// Timeout for collaborator HTTP calls (ms)
    #[serde(default = "default_collaborator_timeout_ms")]
    pub collaborator_timeout_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_collaborator_timeout_ms() -> u64 {
    5_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            predictor_url: None,
            features_url: None,
            odds_url: None,
            collaborator_timeout_ms: default_collaborator_timeout_ms(),
        }
    }
}

/// Resilient cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Remote KV/pub-sub store; `None` runs local-only
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Upper bound on any single remote call (ms)
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,

    /// How long the breaker stays open after a remote failure (s)
    #[serde(default = "default_circuit_cooldown_secs")]
    pub circuit_cooldown_secs: u64,

    #[serde(default = "default_local_max_entries")]
    pub local_max_entries: usize,

    /// Periodic expiry sweep of the local store (s, 0 = lazy expiry only)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_op_timeout_ms() -> u64 {
    5_000
}

fn default_circuit_cooldown_secs() -> u64 {
    30
}

fn default_local_max_entries() -> usize {
    10_000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            op_timeout_ms: default_op_timeout_ms(),
            circuit_cooldown_secs: default_circuit_cooldown_secs(),
            local_max_entries: default_local_max_entries(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_cooldown_secs)
    }
}

/// Streaming calibration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Ring buffer capacity per segment
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,

    /// Samples required before a refit is attempted
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Distinct predicted values required per outcome for a usable curve
    #[serde(default = "default_min_distinct_predictions")]
    pub min_distinct_predictions: usize,

    /// TTL of the persisted window and curve snapshots (s)
    #[serde(default = "default_persist_ttl_secs")]
    pub persist_ttl_secs: u64,
}

fn default_window_capacity() -> usize {
    500
}

fn default_min_samples() -> usize {
    30
}

fn default_min_distinct_predictions() -> usize {
    3
}

fn default_persist_ttl_secs() -> u64 {
    600
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            window_capacity: default_window_capacity(),
            min_samples: default_min_samples(),
            min_distinct_predictions: default_min_distinct_predictions(),
            persist_ttl_secs: default_persist_ttl_secs(),
        }
    }
}

impl CalibrationConfig {
    pub fn persist_ttl(&self) -> Duration {
        Duration::from_secs(self.persist_ttl_secs)
    }
}

/// Prediction serving and staking settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionConfig {
    #[serde(default = "default_record_ttl_secs")]
    pub record_ttl_secs: u64,

    /// Segment used when a request names none (or an unknown one)
    #[serde(default = "default_segment")]
    pub default_segment: String,

    /// Minimum edge (fair - implied) for a value bet
    #[serde(default = "default_min_edge")]
    pub min_edge: f64,

    /// Fractional Kelly multiplier (0.125 = eighth Kelly)
    #[serde(default = "default_kelly_multiplier")]
    pub kelly_multiplier: f64,

    /// Stake cap, percent of bankroll
    #[serde(default = "default_max_stake_pct")]
    pub max_stake_pct: f64,

    #[serde(default = "default_predictor_timeout_ms")]
    pub predictor_timeout_ms: u64,
}

fn default_record_ttl_secs() -> u64 {
    300
}

fn default_segment() -> String {
    "default".to_string()
}

fn default_min_edge() -> f64 {
    0.042
}

fn default_kelly_multiplier() -> f64 {
    0.125
}

fn default_max_stake_pct() -> f64 {
    5.0
}

fn default_predictor_timeout_ms() -> u64 {
    5_000
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            record_ttl_secs: default_record_ttl_secs(),
            default_segment: default_segment(),
            min_edge: default_min_edge(),
            kelly_multiplier: default_kelly_multiplier(),
            max_stake_pct: default_max_stake_pct(),
            predictor_timeout_ms: default_predictor_timeout_ms(),
        }
    }
}

impl PredictionConfig {
    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_secs)
    }

    pub fn predictor_timeout(&self) -> Duration {
        Duration::from_millis(self.predictor_timeout_ms)
    }
}

/// Live broadcast settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default = "default_odds_poll_secs")]
    pub odds_poll_secs: u64,

    #[serde(default = "default_metric_poll_secs")]
    pub metric_poll_secs: u64,

    /// Outbound queue depth per websocket connection
    #[serde(default = "default_connection_buffer")]
    pub connection_buffer: usize,

    /// External renderer revalidation endpoint base URL
    #[serde(default)]
    pub revalidate_url: Option<String>,

    #[serde(default)]
    pub revalidate_secret: Option<String>,

    #[serde(default = "default_revalidate_timeout_ms")]
    pub revalidate_timeout_ms: u64,

    /// Event kinds that trigger revalidation of the match page
    #[serde(default = "default_high_impact_events")]
    pub high_impact_events: Vec<String>,
}

fn default_odds_poll_secs() -> u64 {
    2
}

fn default_metric_poll_secs() -> u64 {
    8
}

fn default_connection_buffer() -> usize {
    256
}

fn default_revalidate_timeout_ms() -> u64 {
    5_000
}

fn default_high_impact_events() -> Vec<String> {
    vec!["goal".to_string()]
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            odds_poll_secs: default_odds_poll_secs(),
            metric_poll_secs: default_metric_poll_secs(),
            connection_buffer: default_connection_buffer(),
            revalidate_url: None,
            revalidate_secret: None,
            revalidate_timeout_ms: default_revalidate_timeout_ms(),
            high_impact_events: default_high_impact_events(),
        }
    }
}

impl LiveConfig {
    pub fn odds_poll_interval(&self) -> Duration {
        Duration::from_secs(self.odds_poll_secs.max(1))
    }

    pub fn metric_poll_interval(&self) -> Duration {
        Duration::from_secs(self.metric_poll_secs.max(1))
    }

    pub fn revalidate_timeout(&self) -> Duration {
        Duration::from_millis(self.revalidate_timeout_ms)
    }

    pub fn is_high_impact(&self, kind: &str) -> bool {
        self.high_impact_events
            .iter()
            .any(|k| k.eq_ignore_ascii_case(kind))
    }
}
