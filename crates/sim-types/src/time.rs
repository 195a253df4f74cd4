//! Simulation Time
//!
//! Time points are unsigned integers. A step of the model covers a half-open
//! interval `[lower, upper)` with a fixed starting event and a limiting upper
//! bound.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A specific point in simulation time.
pub type TimePoint = u64;

/// A distance between two time points.
pub type TimeDuration = u64;

/// Error type for constructing intervals.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    #[error("interval lower bound {lower} exceeds upper bound {upper}")]
    Inverted { lower: TimePoint, upper: TimePoint },
}

/// Half-open interval `[lower, upper)` of simulation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeInterval {
    pub lower: TimePoint,
    pub upper: TimePoint,
}

impl TimeInterval {
    /// Creates an interval, rejecting `lower > upper`.
    pub fn new(lower: TimePoint, upper: TimePoint) -> Result<Self, TimeError> {
        if lower > upper {
            return Err(TimeError::Inverted { lower, upper });
        }
        Ok(Self { lower, upper })
    }

    /// True when no time point lies inside the interval.
    pub fn is_empty(&self) -> bool {
        self.lower >= self.upper
    }

    pub fn contains(&self, t: TimePoint) -> bool {
        self.lower <= t && t < self.upper
    }

    pub fn duration(&self) -> TimeDuration {
        self.upper.saturating_sub(self.lower)
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.lower, self.upper)
    }
}
