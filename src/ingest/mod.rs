//! Telemetry Ingestion
//!
//! Raw CSV inputs and the Schema Normalizer:
//!
//! - `table`: untyped CSV loading with delimiter sniffing
//! - `timestamp`: timestamp cell parsing
//! - `normalizer`: shape detection (long / wide) into `NormalizedRow`s
//! - `boundaries`: lap start/end markers
//! - `results`: race results → DNF flags

pub mod boundaries;
pub mod normalizer;
pub mod results;
pub mod table;
pub mod timestamp;

pub use boundaries::{LapBoundaries, LapWindow};
pub use normalizer::{NormalizedTable, SchemaNormalizer, TableShape};
pub use results::RaceResults;
pub use table::RawTable;
pub use timestamp::parse_timestamp;

use std::path::PathBuf;

/// Fatal input problems. Abort the whole file; nothing partial is returned.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("input has no header or no data rows")]
    EmptyTable,

    #[error("missing mandatory vehicle id column '{column}'")]
    MissingVehicleColumn { column: String },

    #[error("no timestamp column (tried {}) and no lap column (tried {}); laps cannot be assigned", .timestamp_candidates.join(", "), .lap_candidates.join(", "))]
    NoTimestampOrLap {
        timestamp_candidates: Vec<String>,
        lap_candidates: Vec<String>,
    },

    #[error("no recognizable signal layout: expected long-format columns '{signal_name}'/'{signal_value}' or at least one known signal column")]
    NoSignalLayout {
        signal_name: String,
        signal_value: String,
    },

    #[error("no usable telemetry rows after normalization")]
    NoUsableRows,

    #[error("{table} table: missing column (tried {})", .candidates.join(", "))]
    MissingColumn {
        table: &'static str,
        candidates: Vec<String>,
    },
}

impl SchemaError {
    /// Stable machine-readable code, used as the API error code.
    pub fn code(&self) -> &'static str {
        match self {
            SchemaError::Io { .. } => "UNREADABLE_INPUT",
            SchemaError::Csv(_) => "MALFORMED_CSV",
            SchemaError::EmptyTable => "EMPTY_TABLE",
            SchemaError::MissingVehicleColumn { .. } => "MISSING_VEHICLE_COLUMN",
            SchemaError::NoTimestampOrLap { .. } => "NO_TIMESTAMP_OR_LAP",
            SchemaError::NoSignalLayout { .. } => "NO_SIGNAL_LAYOUT",
            SchemaError::NoUsableRows => "NO_USABLE_ROWS",
            SchemaError::MissingColumn { .. } => "MISSING_COLUMN",
        }
    }
}
