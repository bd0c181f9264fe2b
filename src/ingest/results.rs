//! Race results → DNF flags.
//!
//! Official results exports are `;`-separated with a `STATUS` column and a
//! car `NUMBER`, while telemetry names cars by chassis id (`GR86-002-13`).
//! Lookups try the vehicle id first, then the car number carried by the
//! telemetry, then the trailing `-N` of the vehicle id.

use std::collections::BTreeMap;

use super::table::RawTable;
use super::SchemaError;

const STATUS_COLUMN: &str = "STATUS";
const NUMBER_COLUMNS: [&str; 2] = ["NUMBER", "vehicle_number"];
const DNF_STATUS: &str = "DNF";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaceResults {
    by_vehicle: BTreeMap<String, String>,
    by_number: BTreeMap<String, String>,
}

impl RaceResults {
    /// Read a results table keyed by `vehicle_column`, the car number column,
    /// or both.
    pub fn from_table(table: &RawTable, vehicle_column: &str) -> Result<Self, SchemaError> {
        let vehicle_idx = table.column_index(vehicle_column);
        let number_idx = NUMBER_COLUMNS.iter().find_map(|c| table.column_index(c));
        if vehicle_idx.is_none() && number_idx.is_none() {
            let mut candidates = vec![vehicle_column.to_string()];
            candidates.extend(NUMBER_COLUMNS.iter().map(|c| c.to_string()));
            return Err(SchemaError::MissingColumn {
                table: "results",
                candidates,
            });
        }
        let status_idx = table
            .column_index(STATUS_COLUMN)
            .ok_or_else(|| SchemaError::MissingColumn {
                table: "results",
                candidates: vec![STATUS_COLUMN.to_string()],
            })?;

        let mut results = Self::default();
        for cells in table.rows() {
            let status = cells[status_idx].trim();
            if let Some(vehicle) = vehicle_idx.map(|i| cells[i].trim()).filter(|v| !v.is_empty()) {
                results.by_vehicle.insert(vehicle.to_string(), status.to_string());
            }
            if let Some(number) = number_idx.and_then(|i| normalize_number(&cells[i])) {
                results.by_number.insert(number, status.to_string());
            }
        }

        tracing::debug!(
            by_vehicle = results.by_vehicle.len(),
            by_number = results.by_number.len(),
            "Race results loaded"
        );
        Ok(results)
    }

    /// `Some(true)` for a DNF, `None` when the vehicle is not in the results.
    ///
    /// `car_number` is the telemetry's own number for the vehicle, if any.
    pub fn is_dnf(&self, vehicle_id: &str, car_number: Option<&str>) -> Option<bool> {
        self.status_of(vehicle_id, car_number)
            .map(|s| s.eq_ignore_ascii_case(DNF_STATUS))
    }

    fn status_of(&self, vehicle_id: &str, car_number: Option<&str>) -> Option<&str> {
        if let Some(status) = self.by_vehicle.get(vehicle_id.trim()) {
            return Some(status);
        }
        let number = car_number
            .and_then(normalize_number)
            .or_else(|| number_suffix(vehicle_id))?;
        self.by_number.get(&number).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_vehicle.len().max(self.by_number.len())
    }

    pub fn is_empty(&self) -> bool {
        self.by_vehicle.is_empty() && self.by_number.is_empty()
    }
}

/// Car numbers compare as integers when they parse as one (`"013"`, `"13.0"`).
fn normalize_number(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<f64>() {
        Ok(n) if n.is_finite() && n.fract() == 0.0 && n >= 0.0 => Some(format!("{}", n as u64)),
        _ => Some(raw.to_string()),
    }
}

/// `GR86-002-13` → `13`.
fn number_suffix(vehicle_id: &str) -> Option<String> {
    let (_, tail) = vehicle_id.trim().rsplit_once('-')?;
    if tail.is_empty() || !tail.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    normalize_number(tail)
}
