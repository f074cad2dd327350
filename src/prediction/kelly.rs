//! Edge and fractional Kelly staking
//!
//! For decimal odds `o` and fair probability `p`:
//!   implied = 1 / o
//!   edge    = p - implied
//!   f*      = (p * (o - 1) - (1 - p)) / (o - 1)
//!
//! Full Kelly is never staked: f* is scaled by a fractional multiplier
//! (eighth Kelly by default), floored at zero and capped at `max_stake_pct`.

use serde::{Deserialize, Serialize};

use super::models::{OddsBook, Outcome, Probabilities, ValueBet};
use crate::config::PredictionConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakingParams {
    /// Minimum edge (absolute probability) for a value bet
    pub min_edge: f64,
    /// Fractional Kelly multiplier
    pub kelly_multiplier: f64,
    /// Stake cap as % of bankroll
    pub max_stake_pct: f64,
}

impl Default for StakingParams {
    fn default() -> Self {
        Self {
            min_edge: 0.042,
            kelly_multiplier: 0.125,
            max_stake_pct: 5.0,
        }
    }
}

impl From<&PredictionConfig> for StakingParams {
    fn from(config: &PredictionConfig) -> Self {
        Self {
            min_edge: config.min_edge,
            kelly_multiplier: config.kelly_multiplier,
            max_stake_pct: config.max_stake_pct,
        }
    }
}

/// Edge of a fair probability against a decimal price
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceEdge {
    pub implied_probability: f64,
    pub edge: f64,
    pub full_kelly: f64,
}

/// Evaluate one price. `None` for invalid odds or probability.
pub fn evaluate_price(fair_probability: f64, decimal_odds: f64) -> Option<PriceEdge> {
    if !decimal_odds.is_finite() || decimal_odds <= 1.0 {
        return None;
    }
    if !fair_probability.is_finite() || !(0.0..=1.0).contains(&fair_probability) {
        return None;
    }

    let implied = 1.0 / decimal_odds;
    let b = decimal_odds - 1.0;
    let p = fair_probability;
    let q = 1.0 - p;

    Some(PriceEdge {
        implied_probability: implied,
        edge: p - implied,
        full_kelly: (p * b - q) / b,
    })
}

/// Stake as % of bankroll: fractional Kelly, floored at 0, capped.
pub fn kelly_stake_percent(fair_probability: f64, decimal_odds: f64, params: &StakingParams) -> f64 {
    let Some(priced) = evaluate_price(fair_probability, decimal_odds) else {
        return 0.0;
    };
    let cap = params.max_stake_pct.max(0.0);
    let fraction = (priced.full_kelly * params.kelly_multiplier).max(0.0);
    (fraction * 100.0).min(cap)
}

/// Value bet for one outcome at one bookmaker's price, if the edge clears
/// the threshold.
pub fn value_bet(
    outcome: Outcome,
    fair_probability: f64,
    bookmaker: &str,
    decimal_odds: f64,
    params: &StakingParams,
) -> Option<ValueBet> {
    let priced = evaluate_price(fair_probability, decimal_odds)?;
    if priced.edge <= params.min_edge {
        return None;
    }

    Some(ValueBet {
        outcome,
        edge_percent: priced.edge * 100.0,
        implied_probability: priced.implied_probability,
        fair_probability,
        kelly_stake_percent: kelly_stake_percent(fair_probability, decimal_odds, params),
        bookmaker: bookmaker.to_string(),
        decimal_odds,
    })
}

/// Evaluate each outcome at its best available price.
pub fn find_value_bets(fair: &Probabilities, odds: &OddsBook, params: &StakingParams) -> Vec<ValueBet> {
    Outcome::ALL
        .iter()
        .filter_map(|&outcome| {
            let (bookmaker, price) = odds.best_price(outcome)?;
            value_bet(outcome, fair[outcome.index()], bookmaker, price, params)
        })
        .collect()
}
