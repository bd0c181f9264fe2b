//! Shared data structures for the telemetry-to-karma pipeline
//!
//! Each stage produces new immutable values from the previous stage's output:
//! - Stage 1: NormalizedRow (schema normalizer output, lap may be unknown)
//! - Stage 2: CanonicalRow (every row belongs to exactly one lap)
//! - Stage 3: LapFeatureVector (per (vehicle, lap) aggregates)
//! - Stage 4: RiskPrediction (overall + per-component failure probabilities)
//! - Stage 5: KarmaPoint (smoothed per-component health score)

mod telemetry;
mod risk;
mod karma;

pub use telemetry::*;
pub use risk::*;
pub use karma::*;
