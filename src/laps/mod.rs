//! Lap Assigner
//!
//! Gives every normalized row a lap number. Strategies, per vehicle:
//!
//! 1. **Explicit**: the lap column is present and populated on every row.
//!    Labels are kept; rows are checked against timestamp order.
//! 2. **Boundaries**: lap start/end markers exist for the vehicle. Each
//!    timestamp goes to the lap whose `[start, end)` contains it; samples
//!    outside all intervals are dropped.
//! 3. **Fixed window**: equal-width time buckets from the vehicle's first
//!    sample. Approximate: irregular lap durations are misassigned.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::ingest::{LapBoundaries, NormalizedTable, SchemaError};
use crate::pipeline::{DataIntegrityWarning, Diagnostics};
use crate::types::{CanonicalRow, LapAssignment, NormalizedRow};

/// Rows with resolved laps plus the strategy used for each vehicle.
#[derive(Debug, Clone, Default)]
pub struct AssignedLaps {
    /// Sorted by vehicle, lap, timestamp, source order.
    pub rows: Vec<CanonicalRow>,
    pub strategies: BTreeMap<String, LapAssignment>,
}

impl AssignedLaps {
    /// Whether any vehicle's laps are a heuristic reconstruction.
    pub fn is_approximate(&self) -> bool {
        self.strategies.values().any(|s| s.is_approximate())
    }
}

pub struct LapAssigner<'a> {
    window_seconds: f64,
    boundaries: Option<&'a LapBoundaries>,
}

impl<'a> LapAssigner<'a> {
    pub fn new(window_seconds: f64) -> Self {
        Self {
            window_seconds,
            boundaries: None,
        }
    }

    pub fn with_boundaries(mut self, boundaries: &'a LapBoundaries) -> Self {
        self.boundaries = Some(boundaries);
        self
    }

    pub fn assign(
        &self,
        table: NormalizedTable,
        diag: &mut Diagnostics,
    ) -> Result<AssignedLaps, SchemaError> {
        let has_timestamps = table.timestamp_column.is_some();
        let lap_column = table.lap_column.clone();
        let mut by_vehicle: BTreeMap<String, Vec<NormalizedRow>> = BTreeMap::new();
        for row in table.rows {
            by_vehicle.entry(row.vehicle_id.clone()).or_default().push(row);
        }

        let explicit = match &lap_column {
            Some(column) => {
                let missing = by_vehicle.values().flatten().filter(|r| r.lap.is_none()).count();
                if missing == 0 {
                    true
                } else if has_timestamps {
                    diag.push(DataIntegrityWarning::PartialLapColumn {
                        column: column.clone(),
                        missing,
                    });
                    false
                } else {
                    // Nothing to derive laps from: keep the labelled rows.
                    diag.push(DataIntegrityWarning::UnlabeledRows { dropped: missing });
                    for rows in by_vehicle.values_mut() {
                        rows.retain(|r| r.lap.is_some());
                    }
                    by_vehicle.retain(|_, rows| !rows.is_empty());
                    true
                }
            }
            None => false,
        };

        if !explicit && !has_timestamps {
            return Err(SchemaError::NoUsableRows);
        }

        let mut out = AssignedLaps::default();
        for (vehicle_id, rows) in by_vehicle {
            let strategy = if explicit {
                LapAssignment::Explicit
            } else if self.boundaries.is_some_and(|b| b.has_vehicle(&vehicle_id)) {
                LapAssignment::Boundaries
            } else {
                LapAssignment::FixedWindow
            };

            let assigned = match strategy {
                LapAssignment::Explicit => assign_explicit(&vehicle_id, rows, diag),
                LapAssignment::Boundaries => self.assign_boundaries(&vehicle_id, rows, diag),
                LapAssignment::FixedWindow => self.assign_fixed_window(&vehicle_id, rows, diag),
            };

            tracing::debug!(
                vehicle = %vehicle_id,
                strategy = %strategy,
                rows = assigned.len(),
                "Laps assigned"
            );
            if !assigned.is_empty() {
                out.strategies.insert(vehicle_id, strategy);
                out.rows.extend(assigned);
            }
        }

        if out.rows.is_empty() {
            return Err(SchemaError::NoUsableRows);
        }

        out.rows.sort_by(|a, b| {
            (&a.vehicle_id, a.lap, a.timestamp, a.ordinal).cmp(&(&b.vehicle_id, b.lap, b.timestamp, b.ordinal))
        });
        Ok(out)
    }

    fn assign_boundaries(
        &self,
        vehicle_id: &str,
        rows: Vec<NormalizedRow>,
        diag: &mut Diagnostics,
    ) -> Vec<CanonicalRow> {
        let Some(boundaries) = self.boundaries else {
            return Vec::new();
        };
        let total = rows.len();
        let assigned: Vec<CanonicalRow> = rows
            .into_iter()
            .filter_map(|row| {
                let lap = boundaries.lap_at(vehicle_id, row.timestamp?)?;
                Some(canonical(row, lap))
            })
            .collect();

        let dropped = total - assigned.len();
        if dropped > 0 {
            diag.push(DataIntegrityWarning::OutsideLapBoundaries {
                vehicle_id: vehicle_id.to_string(),
                dropped,
            });
        }
        assigned
    }

    fn assign_fixed_window(
        &self,
        vehicle_id: &str,
        rows: Vec<NormalizedRow>,
        diag: &mut Diagnostics,
    ) -> Vec<CanonicalRow> {
        let Some(origin) = rows.iter().filter_map(|r| r.timestamp).min() else {
            return Vec::new();
        };
        diag.push(DataIntegrityWarning::ApproximateLaps {
            vehicle_id: vehicle_id.to_string(),
            window_seconds: self.window_seconds,
        });

        rows.into_iter()
            .filter_map(|row| {
                let ts = row.timestamp?;
                let lap = window_index(origin, ts, self.window_seconds);
                Some(canonical(row, lap))
            })
            .collect()
    }
}

/// Keep the labels; count how often a label decreases in timestamp order.
fn assign_explicit(
    vehicle_id: &str,
    mut rows: Vec<NormalizedRow>,
    diag: &mut Diagnostics,
) -> Vec<CanonicalRow> {
    rows.sort_by_key(|r| (r.timestamp, r.ordinal));
    let out_of_order = rows
        .windows(2)
        .filter(|pair| pair[1].lap < pair[0].lap)
        .count();
    if out_of_order > 0 {
        diag.push(DataIntegrityWarning::OutOfOrderLaps {
            vehicle_id: vehicle_id.to_string(),
            count: out_of_order,
        });
    }

    rows.into_iter()
        .filter_map(|row| {
            let lap = row.lap?;
            Some(canonical(row, lap))
        })
        .collect()
}

/// 1-based bucket index of `ts` in windows of `window_seconds` from `origin`.
fn window_index(origin: DateTime<Utc>, ts: DateTime<Utc>, window_seconds: f64) -> u32 {
    let elapsed = (ts - origin).num_milliseconds() as f64 / 1000.0;
    let bucket = (elapsed / window_seconds).floor();
    if bucket.is_finite() && bucket >= 0.0 {
        (bucket as u32).saturating_add(1)
    } else {
        1
    }
}

fn canonical(row: NormalizedRow, lap: u32) -> CanonicalRow {
    CanonicalRow {
        vehicle_id: row.vehicle_id,
        lap,
        timestamp: row.timestamp,
        signals: row.signals,
        ordinal: row.ordinal,
    }
}
