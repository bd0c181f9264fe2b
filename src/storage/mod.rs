//! Processed-table persistence.
//!
//! Tables are written as CSV files under the processed directory:
//!
//! | File | Rows |
//! |---|---|
//! | `per_lap_features.csv` | one `LapFeatureVector` per (vehicle, lap) |
//! | `risk_predictions.csv` | one `RiskPrediction` per (vehicle, lap) |
//! | `karma_stream.csv` | one `KarmaPoint` per (vehicle, component, lap) |
//! | `vehicle_meta.csv` | one `VehicleMeta` per vehicle |
//!
//! Writes go to a temp file next to the target and are renamed into place,
//! so readers never observe a partially written table.

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::ingest::parse_timestamp;
use crate::types::{Component, KarmaPoint, LapAssignment, LapFeatureVector, RiskPrediction};

pub const FEATURES_FILE: &str = "per_lap_features.csv";
pub const PREDICTIONS_FILE: &str = "risk_predictions.csv";
pub const KARMA_FILE: &str = "karma_stream.csv";
pub const VEHICLES_FILE: &str = "vehicle_meta.csv";

/// Fixed leading columns of the feature table; every other column is a
/// feature.
const FEATURE_META_COLUMNS: [&str; 6] = [
    "vehicle_id",
    "lap",
    "samples_per_lap",
    "lap_start",
    "lap_end",
    "lap_duration_s",
];

/// Per-vehicle facts that are not derivable from the feature table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleMeta {
    pub vehicle_id: String,
    pub vehicle_number: Option<String>,
    pub lap_assignment: Option<LapAssignment>,
    pub dnf_flag: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error ({}): {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("malformed table {}: {reason}", .path.display())]
    Malformed { path: PathBuf, reason: String },
}

/// Directory-backed table store.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    // ========================================================================
    // Feature table
    // ========================================================================

    pub fn save_features(&self, features: &[LapFeatureVector]) -> Result<PathBuf, StorageError> {
        let names: BTreeSet<&str> = features
            .iter()
            .flat_map(|f| f.features.keys().map(String::as_str))
            .collect();

        let mut wtr = csv::Writer::from_writer(Vec::new());
        let header: Vec<&str> = FEATURE_META_COLUMNS.iter().copied().chain(names.iter().copied()).collect();
        wtr.write_record(&header)?;

        for f in features {
            let mut record = vec![
                f.vehicle_id.clone(),
                f.lap.to_string(),
                f.samples_per_lap.to_string(),
                f.lap_start.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)).unwrap_or_default(),
                f.lap_end.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)).unwrap_or_default(),
                opt_f64(f.lap_duration_s()),
            ];
            record.extend(names.iter().map(|n| opt_f64(f.get(n))));
            wtr.write_record(&record)?;
        }

        self.write_atomic(FEATURES_FILE, wtr)
    }

    /// `Ok(None)` when no feature table has been written yet.
    pub fn load_features(&self) -> Result<Option<Vec<LapFeatureVector>>, StorageError> {
        let path = self.path(FEATURES_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let mut rdr = csv::Reader::from_path(&path)?;
        let headers: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();
        for (i, expected) in FEATURE_META_COLUMNS.iter().enumerate() {
            if headers.get(i).map(String::as_str) != Some(*expected) {
                return Err(malformed(&path, format!("expected column {i} to be '{expected}'")));
            }
        }

        let mut out = Vec::new();
        for (row, record) in rdr.records().enumerate() {
            let record = record?;
            let cell = |i: usize| record.get(i).unwrap_or_default().trim();
            let lap = cell(1)
                .parse::<u32>()
                .map_err(|e| malformed(&path, format!("row {row}: lap: {e}")))?;
            let samples_per_lap = cell(2)
                .parse::<usize>()
                .map_err(|e| malformed(&path, format!("row {row}: samples_per_lap: {e}")))?;

            let mut features = BTreeMap::new();
            for (i, name) in headers.iter().enumerate().skip(FEATURE_META_COLUMNS.len()) {
                if let Ok(v) = cell(i).parse::<f64>() {
                    features.insert(name.clone(), v);
                }
            }

            out.push(LapFeatureVector {
                vehicle_id: cell(0).to_string(),
                lap,
                samples_per_lap,
                features,
                lap_start: parse_timestamp(cell(3)),
                lap_end: parse_timestamp(cell(4)),
            });
        }

        tracing::info!(path = %path.display(), laps = out.len(), "Feature table loaded");
        Ok(Some(out))
    }

    // ========================================================================
    // Prediction table
    // ========================================================================

    pub fn save_predictions(&self, predictions: &[RiskPrediction]) -> Result<PathBuf, StorageError> {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        let mut header = vec!["vehicle_id", "lap", "dnf_probability", "risk_level"];
        header.extend(Component::ALL.iter().map(|c| c.as_str()));
        header.extend(["most_at_risk_component", "most_at_risk_probability"]);
        wtr.write_record(&header)?;

        for p in predictions {
            let mut record = vec![
                p.vehicle_id.clone(),
                p.lap.to_string(),
                opt_f64(p.dnf_probability),
                p.risk_level.map(|l| l.to_string()).unwrap_or_default(),
            ];
            record.extend(Component::ALL.iter().map(|c| opt_f64(p.component(*c))));
            record.push(
                p.most_at_risk_component
                    .map(|m| m.component.to_string())
                    .unwrap_or_default(),
            );
            record.push(opt_f64(p.most_at_risk_component.map(|m| m.probability)));
            wtr.write_record(&record)?;
        }

        self.write_atomic(PREDICTIONS_FILE, wtr)
    }

    // ========================================================================
    // Karma stream
    // ========================================================================

    pub fn save_karma(&self, points: &[KarmaPoint]) -> Result<PathBuf, StorageError> {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        wtr.write_record(["vehicle_id", "component", "lap", "instant_score", "karma_score", "trend"])?;
        for p in points {
            wtr.write_record([
                p.vehicle_id.clone(),
                p.component.to_string(),
                p.lap.to_string(),
                p.instant_score.to_string(),
                p.karma_score.to_string(),
                p.trend.to_string(),
            ])?;
        }
        self.write_atomic(KARMA_FILE, wtr)
    }

    // ========================================================================
    // Vehicle metadata
    // ========================================================================

    pub fn save_vehicle_meta(&self, vehicles: &[VehicleMeta]) -> Result<PathBuf, StorageError> {
        let mut wtr = csv::Writer::from_writer(Vec::new());
        if vehicles.is_empty() {
            wtr.write_record(["vehicle_id", "vehicle_number", "lap_assignment", "dnf_flag"])?;
        }
        for v in vehicles {
            wtr.serialize(v)?;
        }
        self.write_atomic(VEHICLES_FILE, wtr)
    }

    /// `Ok(None)` when no metadata table has been written yet.
    pub fn load_vehicle_meta(&self) -> Result<Option<Vec<VehicleMeta>>, StorageError> {
        let path = self.path(VEHICLES_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let mut rdr = csv::Reader::from_path(&path)?;
        let vehicles = rdr.deserialize().collect::<Result<Vec<VehicleMeta>, _>>()?;
        tracing::debug!(path = %path.display(), vehicles = vehicles.len(), "Vehicle metadata loaded");
        Ok(Some(vehicles))
    }

    /// Flush `wtr` to `<file>.tmp`, then rename over `<file>`.
    fn write_atomic(&self, file: &str, wtr: csv::Writer<Vec<u8>>) -> Result<PathBuf, StorageError> {
        let bytes = wtr.into_inner().map_err(|e| StorageError::Io {
            path: self.path(file),
            source: e.into_error(),
        })?;

        let path = self.path(file);
        let tmp_path = path.with_extension("csv.tmp");
        let io_err = |source| StorageError::Io {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        std::fs::write(&tmp_path, &bytes).map_err(io_err)?;
        std::fs::rename(&tmp_path, &path).map_err(io_err)?;

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "Table written");
        Ok(path)
    }
}

fn opt_f64(v: Option<f64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

fn malformed(path: &Path, reason: String) -> StorageError {
    StorageError::Malformed {
        path: path.to_path_buf(),
        reason,
    }
}
