//! Non-fatal pipeline conditions.
//!
//! Fatal problems are `SchemaError`s and abort a file. Everything else is a
//! `PipelineWarning` value: logged when recorded, returned alongside the
//! result, and never turned into a failure of the whole operation.

use serde::Serialize;

/// Data-quality problems that degrade but do not abort processing.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataIntegrityWarning {
    #[error("vehicle {vehicle_id}: {count} lap label(s) out of timestamp order; labels kept as recorded")]
    OutOfOrderLaps { vehicle_id: String, count: usize },

    #[error("{dropped} row(s) dropped with missing or unparsable timestamp in column '{column}'")]
    UnparsableTimestamps { column: String, dropped: usize },

    #[error("{dropped} row(s) dropped with no signal values")]
    EmptySignalRows { dropped: usize },

    #[error("{dropped} row(s) dropped with missing vehicle id")]
    MissingVehicleId { dropped: usize },

    #[error("lap column '{column}' has {missing} missing or invalid value(s), ignoring it")]
    PartialLapColumn { column: String, missing: usize },

    #[error("{dropped} row(s) without lap label dropped (no timestamps to derive laps from)")]
    UnlabeledRows { dropped: usize },

    #[error("vehicle {vehicle_id}: {dropped} sample(s) outside every lap boundary interval dropped")]
    OutsideLapBoundaries { vehicle_id: String, dropped: usize },

    #[error("vehicle {vehicle_id}: laps approximated with {window_seconds}s fixed windows")]
    ApproximateLaps { vehicle_id: String, window_seconds: f64 },

    #[error("lap boundary for vehicle {vehicle_id} lap {lap} skipped: {reason}")]
    MalformedBoundary { vehicle_id: String, lap: u32, reason: String },
}

/// Every non-fatal condition the pipeline can report.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineWarning {
    #[error("data integrity: {0}")]
    DataIntegrity(DataIntegrityWarning),

    #[error("model '{model}' unavailable: {reason}")]
    ModelUnavailable { model: String, reason: String },

    #[error("model '{model}' missing {} input feature(s) on {laps} lap(s), defaults substituted: {}", .missing.len(), .missing.join(", "))]
    FeatureMismatch {
        model: String,
        missing: Vec<String>,
        laps: usize,
    },
}

impl From<DataIntegrityWarning> for PipelineWarning {
    fn from(w: DataIntegrityWarning) -> Self {
        PipelineWarning::DataIntegrity(w)
    }
}

/// Accumulator threaded through the pipeline stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Diagnostics {
    warnings: Vec<PipelineWarning>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a warning and log it.
    pub fn push(&mut self, warning: impl Into<PipelineWarning>) {
        let warning = warning.into();
        tracing::warn!("{}", warning);
        self.warnings.push(warning);
    }

    /// Append warnings already logged elsewhere.
    pub fn extend(&mut self, other: Diagnostics) {
        self.warnings.extend(other.warnings);
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.warnings.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PipelineWarning> {
        self.warnings.iter()
    }

    /// Human-readable messages for API and CLI output.
    pub fn messages(&self) -> Vec<String> {
        self.warnings.iter().map(ToString::to_string).collect()
    }

    pub fn data_integrity(&self) -> impl Iterator<Item = &DataIntegrityWarning> {
        self.warnings.iter().filter_map(|w| match w {
            PipelineWarning::DataIntegrity(d) => Some(d),
            _ => None,
        })
    }
}
