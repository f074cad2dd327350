//! Isotonic calibration curves
//!
//! Pool-adjacent-violators fit of empirical outcome frequency against
//! predicted probability. The result is a list of knots, non-decreasing in
//! both coordinates, evaluated by clipped linear interpolation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::prediction::models::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Knot {
    pub x: f64,
    pub y: f64,
}

/// Immutable calibration mapping for one (segment, outcome)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationCurve {
    pub segment_id: String,
    pub outcome: Outcome,
    pub knots: Vec<Knot>,
    pub sample_count: usize,
    pub updated_at: DateTime<Utc>,
}

impl CalibrationCurve {
    /// Map a raw probability through the curve, clipping to the knot range.
    pub fn map(&self, x: f64) -> f64 {
        interpolate(&self.knots, x)
    }

    /// Knots sorted by x with non-decreasing y.
    pub fn is_monotonic(&self) -> bool {
        self.knots
            .windows(2)
            .all(|w| w[0].x <= w[1].x && w[0].y <= w[1].y)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FitError {
    NonFinite,
    InsufficientDistinct { distinct: usize, required: usize },
}

impl std::fmt::Display for FitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonFinite => write!(f, "non-finite sample value"),
            Self::InsufficientDistinct { distinct, required } => write!(
                f,
                "only {} distinct predicted values (need {})",
                distinct, required
            ),
        }
    }
}

impl std::error::Error for FitError {}

#[derive(Debug, Clone, Copy)]
struct Block {
    sum_x: f64,
    sum_y: f64,
    weight: f64,
}

impl Block {
    fn mean_x(&self) -> f64 {
        self.sum_x / self.weight
    }

    fn mean_y(&self) -> f64 {
        self.sum_y / self.weight
    }

    fn absorb(&mut self, other: Block) {
        self.sum_x += other.sum_x;
        self.sum_y += other.sum_y;
        self.weight += other.weight;
    }
}

/// Fit a non-decreasing step mapping from `(predicted, observed)` pairs.
///
/// `observed` is typically 0.0/1.0 (did this outcome happen). Pairs with
/// identical predictions are pooled before PAV, so `min_distinct` counts
/// distinct predicted values.
pub fn fit_isotonic(points: &[(f64, f64)], min_distinct: usize) -> Result<Vec<Knot>, FitError> {
    if points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
        return Err(FitError::NonFinite);
    }

    let mut sorted: Vec<(f64, f64)> = points.to_vec();
    sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    // Tie groups on x
    let mut groups: Vec<Block> = Vec::with_capacity(sorted.len());
    for (x, y) in sorted {
        match groups.last_mut() {
            Some(last) if (last.mean_x() - x).abs() < f64::EPSILON => {
                last.sum_x += x;
                last.sum_y += y;
                last.weight += 1.0;
            }
            _ => groups.push(Block {
                sum_x: x,
                sum_y: y,
                weight: 1.0,
            }),
        }
    }

    let required = min_distinct.max(2);
    if groups.len() < required {
        return Err(FitError::InsufficientDistinct {
            distinct: groups.len(),
            required,
        });
    }

    // Pool adjacent violators
    let mut stack: Vec<Block> = Vec::with_capacity(groups.len());
    for group in groups {
        stack.push(group);
        while stack.len() >= 2 && stack[stack.len() - 2].mean_y() > stack[stack.len() - 1].mean_y() {
            if let Some(top) = stack.pop() {
                if let Some(prev) = stack.last_mut() {
                    prev.absorb(top);
                }
            }
        }
    }

    Ok(stack
        .iter()
        .map(|b| Knot {
            x: b.mean_x(),
            y: b.mean_y().clamp(0.0, 1.0),
        })
        .collect())
}

/// Clipped piecewise-linear interpolation over sorted knots.
pub fn interpolate(knots: &[Knot], x: f64) -> f64 {
    let (first, last) = match (knots.first(), knots.last()) {
        (Some(f), Some(l)) => (f, l),
        _ => return x,
    };
    if !x.is_finite() {
        return x;
    }
    if x <= first.x {
        return first.y;
    }
    if x >= last.x {
        return last.y;
    }

    // First knot with knot.x > x; guaranteed in 1..len by the clipping above
    let idx = knots.partition_point(|k| k.x <= x);
    let lo = knots[idx - 1];
    let hi = knots[idx];
    let span = hi.x - lo.x;
    if span <= f64::EPSILON {
        return hi.y;
    }
    lo.y + (hi.y - lo.y) * (x - lo.x) / span
}
