//! Mechanical Karma: race telemetry to component health
//!
//! Turns per-timestamp race telemetry into per-lap features, failure-risk
//! predictions and a smoothed per-component "karma" health score.
//!
//! ## Pipeline
//!
//! - **Ingest**: CSV tables, shape detection, timestamp resolution
//! - **Laps**: explicit labels, boundary markers or fixed windows
//! - **Features**: per-lap aggregates per signal
//! - **Inference**: overall DNF and per-component risk models
//! - **Karma**: causal EWMA health series with replay windowing

pub mod api;
pub mod config;
pub mod features;
pub mod inference;
pub mod ingest;
pub mod karma;
pub mod laps;
pub mod pipeline;
pub mod storage;
pub mod types;

// Re-export configuration
pub use config::KarmaConfig;

// Re-export commonly used types
pub use types::{
    CanonicalRow, Component, ComponentRisk, KarmaPoint, LapAssignment, LapFeatureVector,
    NormalizedRow, RiskLevel, RiskPrediction, SignalMap, Trend,
};

// Re-export pipeline entry points
pub use inference::ModelRegistry;
pub use ingest::{RawTable, SchemaError};
pub use pipeline::{Diagnostics, KarmaPipeline, PipelineWarning, ProcessedRace, RaceSideTables, SideInputs};
pub use storage::{ArtifactStore, StorageError, VehicleMeta};
