//! Feature Aggregator
//!
//! Groups canonical rows by (vehicle, lap) and reduces every configured
//! signal to its configured statistics. Output feature names follow
//! `{signal}_{stat}`, e.g. `speed_mean`.
//!
//! Missing values are skipped, never imputed. Standard deviation is the
//! sample (n - 1) definition and is reported as 0 below two samples.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;

use crate::types::{CanonicalRow, LapFeatureVector};

// ============================================================================
// Aggregation Specs
// ============================================================================

/// One statistic computed over the values of a signal within a lap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateStat {
    Mean,
    Max,
    Min,
    Std,
    Count,
}

impl AggregateStat {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateStat::Mean => "mean",
            AggregateStat::Max => "max",
            AggregateStat::Min => "min",
            AggregateStat::Std => "std",
            AggregateStat::Count => "count",
        }
    }

    /// Reduce `values` (finite, at least one) to this statistic.
    fn compute(self, values: &[f64]) -> f64 {
        match self {
            AggregateStat::Mean => Statistics::mean(values),
            AggregateStat::Max => Statistics::max(values),
            AggregateStat::Min => Statistics::min(values),
            AggregateStat::Std => {
                if values.len() < 2 {
                    0.0
                } else {
                    Statistics::std_dev(values)
                }
            }
            AggregateStat::Count => values.len() as f64,
        }
    }
}

impl std::fmt::Display for AggregateStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistics to compute for one signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub signal: String,
    pub stats: Vec<AggregateStat>,
}

/// Column name of an aggregate (`speed` + `Mean` → `speed_mean`).
pub fn feature_name(signal: &str, stat: AggregateStat) -> String {
    format!("{}_{}", signal, stat.as_str())
}

// ============================================================================
// Aggregator
// ============================================================================

/// Per-lap reducer over a fixed aggregation table.
#[derive(Debug, Clone)]
pub struct FeatureAggregator<'a> {
    specs: &'a [AggregationSpec],
}

impl<'a> FeatureAggregator<'a> {
    pub fn new(specs: &'a [AggregationSpec]) -> Self {
        Self { specs }
    }

    /// Every feature name this aggregator can emit, in spec order.
    pub fn feature_names(&self) -> Vec<String> {
        self.specs
            .iter()
            .flat_map(|spec| spec.stats.iter().map(|&stat| feature_name(&spec.signal, stat)))
            .collect()
    }

    /// Aggregate rows into one vector per (vehicle, lap), sorted by vehicle
    /// then lap. Only groups with at least one row exist.
    pub fn aggregate(&self, rows: &[CanonicalRow]) -> Vec<LapFeatureVector> {
        let mut groups: BTreeMap<(&str, u32), Vec<&CanonicalRow>> = BTreeMap::new();
        for row in rows {
            groups
                .entry((row.vehicle_id.as_str(), row.lap))
                .or_default()
                .push(row);
        }

        groups
            .into_iter()
            .map(|((vehicle_id, lap), group)| self.aggregate_group(vehicle_id, lap, &group))
            .collect()
    }

    fn aggregate_group(&self, vehicle_id: &str, lap: u32, group: &[&CanonicalRow]) -> LapFeatureVector {
        let mut features = BTreeMap::new();

        for spec in self.specs {
            let values: Vec<f64> = group
                .iter()
                .filter_map(|row| row.signals.get(&spec.signal).copied())
                .filter(|v| v.is_finite())
                .collect();

            for &stat in &spec.stats {
                if values.is_empty() {
                    // Nothing observed: only the count is meaningful.
                    if stat == AggregateStat::Count {
                        features.insert(feature_name(&spec.signal, stat), 0.0);
                    }
                    continue;
                }
                features.insert(feature_name(&spec.signal, stat), stat.compute(&values));
            }
        }

        let lap_start = group.iter().filter_map(|r| r.timestamp).min();
        let lap_end = group.iter().filter_map(|r| r.timestamp).max();

        LapFeatureVector {
            vehicle_id: vehicle_id.to_string(),
            lap,
            samples_per_lap: group.len(),
            features,
            lap_start,
            lap_end,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
