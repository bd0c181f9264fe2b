//! Karma (component health) points.

use serde::{Deserialize, Serialize};

use super::Component;

/// Direction of the smoothed karma compared with a few laps earlier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Degrading,
    Stable,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trend::Improving => write!(f, "improving"),
            Trend::Degrading => write!(f, "degrading"),
            Trend::Stable => write!(f, "stable"),
        }
    }
}

/// Health score of one component at one lap. 1.0 = fully healthy.
///
/// Derived purely from the risk predictions of laps `<= lap`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KarmaPoint {
    pub vehicle_id: String,
    pub component: Component,
    pub lap: u32,
    /// `1 - risk` for this lap alone, clipped to [0, 1].
    pub instant_score: f64,
    /// Exponentially smoothed score.
    pub karma_score: f64,
    pub trend: Trend,
}
