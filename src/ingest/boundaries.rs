//! Lap boundary markers.
//!
//! Timing systems publish two tables: one lap-start marker and one lap-end
//! marker per (vehicle, lap). Column names vary between exports, so the lap
//! column may be `lap_number` or `lap`, and the time column `timestamp` or
//! `value`. When a lap has several markers the earliest start and the
//! latest end are kept. Laps with only one side are dropped.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

use super::normalizer::parse_lap;
use super::table::RawTable;
use super::timestamp::parse_timestamp;
use super::SchemaError;
use crate::pipeline::{DataIntegrityWarning, Diagnostics};

const LAP_COLUMNS: [&str; 2] = ["lap_number", "lap"];
const TIME_COLUMNS: [&str; 2] = ["timestamp", "value"];

/// Half-open `[start, end)` interval of one lap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LapWindow {
    pub lap: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl LapWindow {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// Per-vehicle lap windows sorted by start time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LapBoundaries {
    windows: BTreeMap<String, Vec<LapWindow>>,
}

impl LapBoundaries {
    /// Build from explicit windows (tests, in-memory callers).
    pub fn from_windows(windows: impl IntoIterator<Item = (String, LapWindow)>) -> Self {
        let mut map: BTreeMap<String, Vec<LapWindow>> = BTreeMap::new();
        for (vehicle, w) in windows {
            map.entry(vehicle).or_default().push(w);
        }
        for list in map.values_mut() {
            list.sort_by_key(|w| (w.start, w.lap));
        }
        Self { windows: map }
    }

    /// Pair start and end marker tables.
    pub fn from_tables(
        starts: &RawTable,
        ends: &RawTable,
        vehicle_column: &str,
        diag: &mut Diagnostics,
    ) -> Result<Self, SchemaError> {
        let starts = read_markers(starts, "lap_start", vehicle_column)?;
        let ends = read_markers(ends, "lap_end", vehicle_column)?;

        let mut windows = Vec::new();
        for ((vehicle, lap), start) in &starts {
            let Some(&end) = ends
                .get(&(vehicle.clone(), *lap))
                .map(|(_, latest)| latest)
            else {
                continue;
            };
            let start = start.0;
            if end <= start {
                diag.push(DataIntegrityWarning::MalformedBoundary {
                    vehicle_id: vehicle.clone(),
                    lap: *lap,
                    reason: format!("end {end} is not after start {start}"),
                });
                continue;
            }
            windows.push((vehicle.clone(), LapWindow { lap: *lap, start, end }));
        }

        let unpaired = starts.len() + ends.len() - 2 * windows.len();
        let boundaries = Self::from_windows(windows);
        tracing::info!(
            vehicles = boundaries.windows.len(),
            laps = boundaries.lap_count(),
            unpaired,
            "Lap boundaries loaded"
        );
        Ok(boundaries)
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn lap_count(&self) -> usize {
        self.windows.values().map(Vec::len).sum()
    }

    pub fn has_vehicle(&self, vehicle_id: &str) -> bool {
        self.windows.contains_key(vehicle_id)
    }

    pub fn windows(&self, vehicle_id: &str) -> &[LapWindow] {
        self.windows.get(vehicle_id).map_or(&[], Vec::as_slice)
    }

    /// Lap whose `[start, end)` contains `ts`; the latest start wins when
    /// windows overlap.
    pub fn lap_at(&self, vehicle_id: &str, ts: DateTime<Utc>) -> Option<u32> {
        let windows = self.windows(vehicle_id);
        let upto = windows.partition_point(|w| w.start <= ts);
        windows[..upto]
            .iter()
            .rev()
            .find(|w| w.contains(ts))
            .map(|w| w.lap)
    }
}

/// (vehicle, lap) → (earliest, latest) marker time.
type Markers = HashMap<(String, u32), (DateTime<Utc>, DateTime<Utc>)>;

fn read_markers(
    table: &RawTable,
    name: &'static str,
    vehicle_column: &str,
) -> Result<Markers, SchemaError> {
    let vehicle_idx = table
        .column_index(vehicle_column)
        .ok_or_else(|| SchemaError::MissingColumn {
            table: name,
            candidates: vec![vehicle_column.to_string()],
        })?;
    let lap_idx = first_column(table, &LAP_COLUMNS, name)?;
    let time_idx = first_column(table, &TIME_COLUMNS, name)?;

    let mut markers: Markers = HashMap::new();
    for cells in table.rows() {
        let vehicle = cells[vehicle_idx].trim();
        let (Some(lap), Some(ts)) = (parse_lap(&cells[lap_idx]), parse_timestamp(&cells[time_idx]))
        else {
            continue;
        };
        if vehicle.is_empty() {
            continue;
        }
        markers
            .entry((vehicle.to_string(), lap))
            .and_modify(|(lo, hi)| {
                *lo = (*lo).min(ts);
                *hi = (*hi).max(ts);
            })
            .or_insert((ts, ts));
    }
    Ok(markers)
}

fn first_column(table: &RawTable, candidates: &[&str], name: &'static str) -> Result<usize, SchemaError> {
    candidates
        .iter()
        .find_map(|c| table.column_index(c))
        .ok_or_else(|| SchemaError::MissingColumn {
            table: name,
            candidates: candidates.iter().map(ToString::to_string).collect(),
        })
}
