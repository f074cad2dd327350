//! Edgeline Backend Library
//!
//! Live prediction serving core: resilient caching, streaming calibration,
//! prediction orchestration and live topic fan-out. The binary wires these
//! together; tests drive them directly.

pub mod api;
pub mod cache;
pub mod calibration;
pub mod config;
pub mod live;
pub mod prediction;

pub use cache::ResilientCache;
pub use calibration::CalibrationTracker;
pub use config::ServiceConfig;
pub use live::BroadcastHub;
pub use prediction::PredictionOrchestrator;
