//! Prediction serving
//!
//! - `models`: outcomes, odds books, value bets, prediction records
//! - `kelly`: edge and fractional Kelly staking
//! - `collaborators`: `Predictor`, `FeatureProvider`, `Repository` contracts
//! - `http`: JSON-over-HTTP adapters for those contracts
//! - `orchestrator`: `PredictionOrchestrator`

pub mod collaborators;
pub mod http;
pub mod kelly;
pub mod models;
pub mod orchestrator;

pub use collaborators::{
    FeatureError, FeatureProvider, Inference, ModelError, Predictor, Repository, Unconfigured,
};
pub use http::{HttpFeatureProvider, HttpOddsRepository, HttpPredictor};
pub use kelly::{find_value_bets, kelly_stake_percent, StakingParams};
pub use models::{
    FeatureMap, MarketOdds, OddsBook, Outcome, PredictionRecord, Probabilities, ValueBet,
};
pub use orchestrator::{PredictionError, PredictionOrchestrator};
