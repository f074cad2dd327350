//! Prediction domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 3-way match result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Home,
    Draw,
    Away,
}

impl Outcome {
    pub const ALL: [Outcome; 3] = [Outcome::Home, Outcome::Draw, Outcome::Away];

    pub fn index(self) -> usize {
        match self {
            Outcome::Home => 0,
            Outcome::Draw => 1,
            Outcome::Away => 2,
        }
    }

    pub fn from_index(idx: usize) -> Option<Self> {
        Self::ALL.get(idx).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Home => "home",
            Outcome::Draw => "draw",
            Outcome::Away => "away",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Home/draw/away probabilities, indexed by `Outcome::index`
pub type Probabilities = [f64; 3];

/// Flat numeric feature vector handed to a `Predictor`
pub type FeatureMap = HashMap<String, f64>;

/// Check a probability vector: finite, within [0, 1], summing to ~1.
pub fn validate_probabilities(probs: &Probabilities) -> Result<(), String> {
    if let Some(p) = probs.iter().find(|p| !p.is_finite() || **p < 0.0 || **p > 1.0) {
        return Err(format!("probability out of range: {}", p));
    }
    let sum: f64 = probs.iter().sum();
    if (sum - 1.0).abs() > 0.01 {
        return Err(format!("probabilities sum to {:.4}", sum));
    }
    Ok(())
}

/// Rescale non-negative weights to sum to 1. `None` if they cannot be.
pub fn normalize(probs: &Probabilities) -> Option<Probabilities> {
    if probs.iter().any(|p| !p.is_finite() || *p < 0.0) {
        return None;
    }
    let sum: f64 = probs.iter().sum();
    if sum <= f64::EPSILON {
        return None;
    }
    Some([probs[0] / sum, probs[1] / sum, probs[2] / sum])
}

/// One bookmaker's decimal prices for home/draw/away
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOdds {
    pub bookmaker: String,
    pub prices: [f64; 3],
}

/// Latest prices across bookmakers for a match
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OddsBook {
    pub match_id: String,
    pub markets: Vec<MarketOdds>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl OddsBook {
    pub fn new(match_id: impl Into<String>, markets: Vec<MarketOdds>) -> Self {
        Self {
            match_id: match_id.into(),
            markets,
            updated_at: Some(Utc::now()),
        }
    }

    /// Best (highest) valid decimal price for an outcome, with its bookmaker.
    pub fn best_price(&self, outcome: Outcome) -> Option<(&str, f64)> {
        let idx = outcome.index();
        self.markets
            .iter()
            .filter(|m| m.prices[idx].is_finite() && m.prices[idx] > 1.0)
            .fold(None, |best: Option<(&str, f64)>, m| match best {
                Some((_, price)) if price >= m.prices[idx] => best,
                _ => Some((m.bookmaker.as_str(), m.prices[idx])),
            })
    }

    /// Same prices, ignoring timestamps.
    pub fn same_prices(&self, other: &OddsBook) -> bool {
        self.markets == other.markets
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }
}

/// Positive-edge opportunity at a bookmaker's price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueBet {
    pub outcome: Outcome,
    pub edge_percent: f64,
    pub implied_probability: f64,
    pub fair_probability: f64,
    pub kelly_stake_percent: f64,
    pub bookmaker: String,
    pub decimal_odds: f64,
}

/// Result of one prediction, cached and superseded as a whole
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub match_id: String,
    pub segment_id: String,
    pub raw_probabilities: Probabilities,
    pub calibrated_probabilities: Probabilities,
    pub model_version: String,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub value_bets: Vec<ValueBet>,
}

impl PredictionRecord {
    pub fn fair_probability(&self, outcome: Outcome) -> f64 {
        self.calibrated_probabilities[outcome.index()]
    }
}
