//! Schema Normalizer
//!
//! Turns a `RawTable` into `NormalizedRow`s, one per physical moment.
//!
//! Column resolution is an ordered list of candidates, first present wins.
//! Shape detection is an ordered list of strategies:
//!
//! 1. **Long**: signal-name and signal-value columns both present. Rows of
//!    the same vehicle at the same timestamp collapse into one moment.
//! 2. **Wide**: at least one recognized signal column present. Each row is
//!    already one moment.
//!
//! Only recognized signals (those with an aggregation spec) are kept, in
//! either shape. Unrecognized columns are ignored.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::table::RawTable;
use super::timestamp::parse_timestamp;
use super::SchemaError;
use crate::config::{ColumnsConfig, KarmaConfig};
use crate::pipeline::{DataIntegrityWarning, Diagnostics};
use crate::types::{NormalizedRow, SignalMap};

/// Detected layout of the source table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableShape {
    Long,
    Wide,
}

impl std::fmt::Display for TableShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableShape::Long => write!(f, "long"),
            TableShape::Wide => write!(f, "wide"),
        }
    }
}

/// Strategies tried in order; first match wins.
const SHAPE_STRATEGIES: [TableShape; 2] = [TableShape::Long, TableShape::Wide];

/// Column indices of the detected shape.
#[derive(Debug, Clone)]
enum Layout {
    Long { name_idx: usize, value_idx: usize },
    Wide { signals: Vec<(usize, String)> },
}

/// Normalizer output.
#[derive(Debug, Clone)]
pub struct NormalizedTable {
    pub shape: TableShape,
    /// Resolved timestamp column, if any.
    pub timestamp_column: Option<String>,
    /// Resolved lap column, if any. Rows may still lack a lap value.
    pub lap_column: Option<String>,
    /// Moments in source order.
    pub rows: Vec<NormalizedRow>,
    /// Data rows in the source table.
    pub source_rows: usize,
    /// Car number per vehicle id, when the table has a vehicle number column.
    pub vehicle_numbers: BTreeMap<String, String>,
}

impl NormalizedTable {
    pub fn vehicles(&self) -> BTreeSet<&str> {
        self.rows.iter().map(|r| r.vehicle_id.as_str()).collect()
    }
}

/// Resolved positions of the bookkeeping columns.
struct KeyColumns {
    vehicle: usize,
    vehicle_number: Option<usize>,
    timestamp: Option<(usize, String)>,
    lap: Option<(usize, String)>,
}

pub struct SchemaNormalizer<'a> {
    columns: &'a ColumnsConfig,
    signals: Vec<String>,
}

impl<'a> SchemaNormalizer<'a> {
    /// Normalizer that keeps only the given signals.
    pub fn new(columns: &'a ColumnsConfig, signals: impl IntoIterator<Item = String>) -> Self {
        Self {
            columns,
            signals: signals.into_iter().collect(),
        }
    }

    /// Normalizer recognizing every signal that has an aggregation spec.
    pub fn from_config(config: &'a KarmaConfig) -> Self {
        Self::new(
            &config.columns,
            config.aggregation.iter().map(|spec| spec.signal.clone()),
        )
    }

    pub fn normalize(
        &self,
        table: &RawTable,
        diag: &mut Diagnostics,
    ) -> Result<NormalizedTable, SchemaError> {
        if table.is_empty() {
            return Err(SchemaError::EmptyTable);
        }

        let keys = self.resolve_key_columns(table)?;
        let layout = SHAPE_STRATEGIES
            .iter()
            .find_map(|&shape| self.detect(shape, table, &keys))
            .ok_or_else(|| SchemaError::NoSignalLayout {
                signal_name: self.columns.signal_name.clone(),
                signal_value: self.columns.signal_value.clone(),
            })?;

        let mut counters = DropCounters::default();
        let (shape, rows) = match &layout {
            Layout::Long { name_idx, value_idx } => (
                TableShape::Long,
                self.collect_long(table, &keys, *name_idx, *value_idx, &mut counters),
            ),
            Layout::Wide { signals } => (
                TableShape::Wide,
                self.collect_wide(table, &keys, signals, &mut counters),
            ),
        };

        counters.report(keys.timestamp.as_ref().map(|(_, name)| name.as_str()), diag);

        if rows.is_empty() {
            return Err(SchemaError::NoUsableRows);
        }
        let vehicle_numbers = keys
            .vehicle_number
            .map(|idx| collect_vehicle_numbers(table, keys.vehicle, idx))
            .unwrap_or_default();

        tracing::info!(
            shape = %shape,
            source_rows = table.len(),
            moments = rows.len(),
            timestamp_column = ?keys.timestamp.as_ref().map(|(_, n)| n),
            lap_column = ?keys.lap.as_ref().map(|(_, n)| n),
            "Telemetry normalized"
        );

        Ok(NormalizedTable {
            shape,
            timestamp_column: keys.timestamp.map(|(_, name)| name),
            lap_column: keys.lap.map(|(_, name)| name),
            rows,
            source_rows: table.len(),
            vehicle_numbers,
        })
    }

    fn resolve_key_columns(&self, table: &RawTable) -> Result<KeyColumns, SchemaError> {
        let vehicle = table.column_index(&self.columns.vehicle).ok_or_else(|| {
            SchemaError::MissingVehicleColumn {
                column: self.columns.vehicle.clone(),
            }
        })?;

        let timestamp = table
            .resolve_column(&self.columns.timestamp_candidates)
            .map(|(idx, name)| (idx, name.to_string()));
        let lap = table
            .resolve_column(&self.columns.lap_candidates)
            .map(|(idx, name)| (idx, name.to_string()));

        if timestamp.is_none() && lap.is_none() {
            return Err(SchemaError::NoTimestampOrLap {
                timestamp_candidates: self.columns.timestamp_candidates.clone(),
                lap_candidates: self.columns.lap_candidates.clone(),
            });
        }

        Ok(KeyColumns {
            vehicle,
            vehicle_number: table.column_index(&self.columns.vehicle_number),
            timestamp,
            lap,
        })
    }

    fn detect(&self, shape: TableShape, table: &RawTable, keys: &KeyColumns) -> Option<Layout> {
        match shape {
            TableShape::Long => {
                let name_idx = table.column_index(&self.columns.signal_name)?;
                let value_idx = table.column_index(&self.columns.signal_value)?;
                Some(Layout::Long {
                    name_idx,
                    value_idx,
                })
            }
            TableShape::Wide => {
                let reserved = [
                    Some(keys.vehicle),
                    keys.vehicle_number,
                    keys.timestamp.as_ref().map(|(i, _)| *i),
                    keys.lap.as_ref().map(|(i, _)| *i),
                ];
                let signals: Vec<(usize, String)> = self
                    .signals
                    .iter()
                    .filter_map(|s| table.column_index(s).map(|idx| (idx, s.clone())))
                    .filter(|(idx, _)| !reserved.contains(&Some(*idx)))
                    .collect();
                if signals.is_empty() {
                    None
                } else {
                    Some(Layout::Wide { signals })
                }
            }
        }
    }

    fn collect_wide(
        &self,
        table: &RawTable,
        keys: &KeyColumns,
        signals: &[(usize, String)],
        counters: &mut DropCounters,
    ) -> Vec<NormalizedRow> {
        let mut out = Vec::with_capacity(table.len());
        for (ordinal, cells) in table.rows().iter().enumerate() {
            let Some(key) = read_row_key(cells, keys, counters) else {
                continue;
            };

            let values: SignalMap = signals
                .iter()
                .filter_map(|(idx, name)| parse_value(&cells[*idx]).map(|v| (name.clone(), v)))
                .collect();
            if values.is_empty() {
                counters.empty_signals += 1;
                continue;
            }

            out.push(NormalizedRow {
                vehicle_id: key.vehicle_id,
                lap: key.lap,
                timestamp: key.timestamp,
                signals: values,
                ordinal,
            });
        }
        out
    }

    fn collect_long(
        &self,
        table: &RawTable,
        keys: &KeyColumns,
        name_idx: usize,
        value_idx: usize,
        counters: &mut DropCounters,
    ) -> Vec<NormalizedRow> {
        let mut moments: Vec<MomentAccumulator> = Vec::new();
        let mut index: HashMap<MomentKey, usize> = HashMap::new();
        // Without timestamps the k-th value of a signal within a lap is
        // the k-th moment of that lap.
        let mut occurrences: HashMap<(String, Option<u32>, String), usize> = HashMap::new();

        for (ordinal, cells) in table.rows().iter().enumerate() {
            let Some(key) = read_row_key(cells, keys, counters) else {
                continue;
            };
            let Some(signal) = self.recognize(&cells[name_idx]) else {
                continue;
            };
            let Some(value) = parse_value(&cells[value_idx]) else {
                counters.empty_signals += 1;
                continue;
            };

            let moment_key = match key.timestamp {
                Some(ts) => MomentKey::Timed(key.vehicle_id.clone(), ts),
                None => {
                    let slot = occurrences
                        .entry((key.vehicle_id.clone(), key.lap, signal.to_string()))
                        .or_insert(0);
                    let k = *slot;
                    *slot += 1;
                    MomentKey::Ordered(key.vehicle_id.clone(), key.lap, k)
                }
            };

            let pos = *index.entry(moment_key).or_insert_with(|| {
                moments.push(MomentAccumulator::new(&key, ordinal));
                moments.len() - 1
            });
            moments[pos].add(key.lap, signal, value);
        }

        moments.into_iter().map(MomentAccumulator::finish).collect()
    }

    /// Map a long-format signal name onto a recognized signal.
    fn recognize(&self, raw: &str) -> Option<&str> {
        let name = raw.trim();
        self.signals
            .iter()
            .find(|s| s.as_str() == name)
            .or_else(|| self.signals.iter().find(|s| s.eq_ignore_ascii_case(name)))
            .map(String::as_str)
    }
}

// ============================================================================
// Row helpers
// ============================================================================

#[derive(Debug, Default)]
struct DropCounters {
    bad_timestamp: usize,
    missing_vehicle: usize,
    empty_signals: usize,
}

impl DropCounters {
    fn report(&self, timestamp_column: Option<&str>, diag: &mut Diagnostics) {
        if self.missing_vehicle > 0 {
            diag.push(DataIntegrityWarning::MissingVehicleId {
                dropped: self.missing_vehicle,
            });
        }
        if self.bad_timestamp > 0 {
            diag.push(DataIntegrityWarning::UnparsableTimestamps {
                column: timestamp_column.unwrap_or_default().to_string(),
                dropped: self.bad_timestamp,
            });
        }
        if self.empty_signals > 0 {
            diag.push(DataIntegrityWarning::EmptySignalRows {
                dropped: self.empty_signals,
            });
        }
    }
}

struct RowKey {
    vehicle_id: String,
    timestamp: Option<DateTime<Utc>>,
    lap: Option<u32>,
}

fn read_row_key(cells: &[String], keys: &KeyColumns, counters: &mut DropCounters) -> Option<RowKey> {
    let vehicle_id = cells[keys.vehicle].trim();
    if vehicle_id.is_empty() {
        counters.missing_vehicle += 1;
        return None;
    }

    let timestamp = match &keys.timestamp {
        Some((idx, _)) => match parse_timestamp(&cells[*idx]) {
            Some(ts) => Some(ts),
            None => {
                counters.bad_timestamp += 1;
                return None;
            }
        },
        None => None,
    };

    let lap = keys.lap.as_ref().and_then(|(idx, _)| parse_lap(&cells[*idx]));

    Some(RowKey {
        vehicle_id: vehicle_id.to_string(),
        timestamp,
        lap,
    })
}

/// First car number seen for each vehicle id.
fn collect_vehicle_numbers(table: &RawTable, vehicle_idx: usize, number_idx: usize) -> BTreeMap<String, String> {
    let mut numbers = BTreeMap::new();
    for cells in table.rows() {
        let vehicle_id = cells[vehicle_idx].trim();
        let number = cells[number_idx].trim();
        if !vehicle_id.is_empty() && !number.is_empty() {
            numbers
                .entry(vehicle_id.to_string())
                .or_insert_with(|| number.to_string());
        }
    }
    numbers
}

/// Numeric cell; empty, non-numeric and non-finite cells are missing.
fn parse_value(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Lap labels are positive integers; `3` and `3.0` are both accepted.
pub(crate) fn parse_lap(raw: &str) -> Option<u32> {
    let v = parse_value(raw)?;
    if v < 1.0 || v.fract() != 0.0 || v > f64::from(u32::MAX) {
        return None;
    }
    Some(v as u32)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MomentKey {
    Timed(String, DateTime<Utc>),
    Ordered(String, Option<u32>, usize),
}

/// Partial wide row assembled from long rows. Repeated readings of one
/// signal at one moment are averaged.
struct MomentAccumulator {
    vehicle_id: String,
    timestamp: Option<DateTime<Utc>>,
    lap: Option<u32>,
    ordinal: usize,
    sums: HashMap<String, (f64, usize)>,
}

impl MomentAccumulator {
    fn new(key: &RowKey, ordinal: usize) -> Self {
        Self {
            vehicle_id: key.vehicle_id.clone(),
            timestamp: key.timestamp,
            lap: key.lap,
            ordinal,
            sums: HashMap::new(),
        }
    }

    fn add(&mut self, lap: Option<u32>, signal: &str, value: f64) {
        if self.lap.is_none() {
            self.lap = lap;
        }
        let entry = self.sums.entry(signal.to_string()).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }

    fn finish(self) -> NormalizedRow {
        let signals = self
            .sums
            .into_iter()
            .map(|(name, (sum, n))| (name, sum / n as f64))
            .collect();
        NormalizedRow {
            vehicle_id: self.vehicle_id,
            lap: self.lap,
            timestamp: self.timestamp,
            signals,
            ordinal: self.ordinal,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer(columns: &ColumnsConfig) -> SchemaNormalizer<'_> {
        SchemaNormalizer::new(columns, ["speed".to_string(), "gear".to_string()])
    }

    fn table(csv: &str) -> RawTable {
        RawTable::from_bytes(csv.as_bytes()).unwrap()
    }

    #[test]
    fn test_long_rows_merge_by_vehicle_and_timestamp() {
        let columns = ColumnsConfig::default();
        let t = table(
            "vehicle_id,meta_time,telemetry_name,telemetry_value\n\
             V1,2025-04-05T14:00:00Z,speed,100\n\
             V1,2025-04-05T14:00:00Z,gear,3\n\
             V1,2025-04-05T14:00:01Z,speed,101\n\
             V2,2025-04-05T14:00:00Z,speed,90\n",
        );
        let mut diag = Diagnostics::new();
        let out = normalizer(&columns).normalize(&t, &mut diag).unwrap();
        assert_eq!(out.shape, TableShape::Long);
        assert_eq!(out.rows.len(), 3);
        assert_eq!(out.rows[0].signals.get("gear"), Some(&3.0));
        assert_eq!(out.rows[0].signals.get("speed"), Some(&100.0));
        assert_eq!(out.rows[2].vehicle_id, "V2");
        assert!(diag.is_empty());
    }

    #[test]
    fn test_wide_rows_pass_through() {
        let columns = ColumnsConfig::default();
        let t = table("vehicle_id,timestamp,speed,gear,driver\nV1,1743861600,100,3,Ann\n");
        let mut diag = Diagnostics::new();
        let out = normalizer(&columns).normalize(&t, &mut diag).unwrap();
        assert_eq!(out.shape, TableShape::Wide);
        assert_eq!(out.timestamp_column.as_deref(), Some("timestamp"));
        assert_eq!(out.rows[0].signals.len(), 2);
    }

    #[test]
    fn test_missing_vehicle_column_is_fatal() {
        let columns = ColumnsConfig::default();
        let t = table("car,timestamp,speed\n1,1743861600,100\n");
        let err = normalizer(&columns)
            .normalize(&t, &mut Diagnostics::new())
            .unwrap_err();
        assert!(matches!(err, SchemaError::MissingVehicleColumn { .. }));
    }

    #[test]
    fn test_no_timestamp_and_no_lap_is_fatal() {
        let columns = ColumnsConfig::default();
        let t = table("vehicle_id,speed\nV1,100\n");
        let err = normalizer(&columns)
            .normalize(&t, &mut Diagnostics::new())
            .unwrap_err();
        assert!(matches!(err, SchemaError::NoTimestampOrLap { .. }));
    }

    #[test]
    fn test_unknown_layout_is_fatal() {
        let columns = ColumnsConfig::default();
        let t = table("vehicle_id,lap,driver\nV1,1,Ann\n");
        let err = normalizer(&columns)
            .normalize(&t, &mut Diagnostics::new())
            .unwrap_err();
        assert!(matches!(err, SchemaError::NoSignalLayout { .. }));
    }

    #[test]
    fn test_bad_rows_dropped_with_warnings() {
        let columns = ColumnsConfig::default();
        let t = table(
            "vehicle_id,timestamp,speed\n\
             V1,1743861600,100\n\
             V1,not-a-time,100\n\
             ,1743861601,100\n\
             V1,1743861602,\n",
        );
        let mut diag = Diagnostics::new();
        let out = normalizer(&columns).normalize(&t, &mut diag).unwrap();
        assert_eq!(out.rows.len(), 1);
        assert_eq!(diag.data_integrity().count(), 3);
    }

    #[test]
    fn test_long_without_timestamps_merges_by_occurrence() {
        let columns = ColumnsConfig::default();
        let t = table(
            "vehicle_id,lap,telemetry_name,telemetry_value\n\
             V1,1,speed,100\n\
             V1,1,gear,3\n\
             V1,1,speed,102\n\
             V1,1,gear,4\n",
        );
        let out = normalizer(&columns)
            .normalize(&t, &mut Diagnostics::new())
            .unwrap();
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.rows[1].signals.get("speed"), Some(&102.0));
        assert_eq!(out.rows[1].signals.get("gear"), Some(&4.0));
        assert_eq!(out.rows[1].lap, Some(1));
    }

    #[test]
    fn test_duplicate_reading_at_same_moment_is_averaged() {
        let columns = ColumnsConfig::default();
        let t = table(
            "vehicle_id,timestamp,telemetry_name,telemetry_value\n\
             V1,1743861600,speed,100\n\
             V1,1743861600,speed,104\n",
        );
        let out = normalizer(&columns)
            .normalize(&t, &mut Diagnostics::new())
            .unwrap();
        assert_eq!(out.rows[0].signals.get("speed"), Some(&102.0));
    }

    #[test]
    fn test_vehicle_numbers_collected_and_not_treated_as_signal() {
        let columns = ColumnsConfig::default();
        let t = table(
            "vehicle_id,vehicle_number,meta_time,speed\n\
             GR86-002-13,13,2025-04-05T14:00:00Z,100\n\
             GR86-002-13,13,2025-04-05T14:00:01Z,101\n\
             GR86-004-7,,2025-04-05T14:00:00Z,90\n",
        );
        let signals = ["speed".to_string(), "vehicle_number".to_string()];
        let out = SchemaNormalizer::new(&columns, signals)
            .normalize(&t, &mut Diagnostics::new())
            .unwrap();
        assert_eq!(out.vehicle_numbers.get("GR86-002-13").map(String::as_str), Some("13"));
        assert!(!out.vehicle_numbers.contains_key("GR86-004-7"));
        assert!(out.rows.iter().all(|r| !r.signals.contains_key("vehicle_number")));
    }

    #[test]
    fn test_parse_lap_rules() {
        assert_eq!(parse_lap("3"), Some(3));
        assert_eq!(parse_lap("3.0"), Some(3));
        assert_eq!(parse_lap("0"), None);
        assert_eq!(parse_lap("2.5"), None);
        assert_eq!(parse_lap(""), None);
    }
}
