//! Telemetry rows and per-lap feature vectors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Signal name → numeric value for one physical moment.
///
/// Missing signals are absent from the map, never zero-filled.
pub type SignalMap = BTreeMap<String, f64>;

/// Output of the schema normalizer: one physical moment for one vehicle.
///
/// `lap` is `None` when the source carried no usable lap column; the lap
/// assigner resolves it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub vehicle_id: String,
    pub lap: Option<u32>,
    pub timestamp: Option<DateTime<Utc>>,
    pub signals: SignalMap,
    /// Position of the (first) source row, used as a stable tie-breaker.
    pub ordinal: usize,
}

/// A telemetry moment with a resolved lap number (always >= 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub vehicle_id: String,
    pub lap: u32,
    pub timestamp: Option<DateTime<Utc>>,
    pub signals: SignalMap,
    pub ordinal: usize,
}

/// How the laps of a vehicle were determined.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LapAssignment {
    /// Lap column present and fully populated in the source.
    Explicit,
    /// Derived from lap start/end boundary markers.
    Boundaries,
    /// Equal-width time buckets. Approximate.
    FixedWindow,
}

impl LapAssignment {
    /// Whether lap numbers are a heuristic reconstruction.
    pub fn is_approximate(self) -> bool {
        matches!(self, LapAssignment::FixedWindow)
    }
}

impl std::fmt::Display for LapAssignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LapAssignment::Explicit => write!(f, "explicit"),
            LapAssignment::Boundaries => write!(f, "boundaries"),
            LapAssignment::FixedWindow => write!(f, "fixed_window"),
        }
    }
}

/// One row per (vehicle, lap): configured aggregates of every signal.
///
/// Feature names follow `{signal}_{stat}` (e.g. `speed_mean`). A lap with
/// zero underlying rows never produces a vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapFeatureVector {
    pub vehicle_id: String,
    pub lap: u32,
    pub samples_per_lap: usize,
    pub features: BTreeMap<String, f64>,
    #[serde(default)]
    pub lap_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lap_end: Option<DateTime<Utc>>,
}

impl LapFeatureVector {
    /// Look up a named aggregate.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.features.get(name).copied()
    }

    /// Elapsed seconds between the first and last sample of the lap.
    pub fn lap_duration_s(&self) -> Option<f64> {
        match (self.lap_start, self.lap_end) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        }
    }
}
