//! Streaming probability calibration
//!
//! - `isotonic`: PAV fitting and immutable `CalibrationCurve` snapshots
//! - `tracker`: per-segment sample windows, refits and `apply`

pub mod isotonic;
pub mod tracker;

pub use isotonic::{fit_isotonic, CalibrationCurve, FitError, Knot};
pub use tracker::{CalibrationError, CalibrationSample, CalibrationTracker};
