//! Karma Stream Builder
//!
//! Per-component health series derived from risk predictions:
//!
//! ```text
//! instant(lap) = clamp(1 - p_component(lap), 0, 1)
//! karma(first) = instant(first)
//! karma(lap)   = s * karma(prev) + (1 - s) * instant(lap)
//! ```
//!
//! The fold restarts from the first lap on every call, so a series cut at
//! `max_lap` is exactly what it would have been had later laps never been
//! recorded. No smoothing state survives between calls.

use std::collections::BTreeMap;

use crate::config::KarmaStreamConfig;
use crate::types::{Component, KarmaPoint, RiskPrediction, Trend};

pub struct KarmaStreamBuilder<'a> {
    config: &'a KarmaStreamConfig,
}

impl<'a> KarmaStreamBuilder<'a> {
    pub fn new(config: &'a KarmaStreamConfig) -> Self {
        Self { config }
    }

    /// Karma points for every vehicle and component with laps `<= max_lap`,
    /// sorted by vehicle, component, lap.
    pub fn build(&self, predictions: &[RiskPrediction], max_lap: Option<u32>) -> Vec<KarmaPoint> {
        let mut by_vehicle: BTreeMap<&str, Vec<&RiskPrediction>> = BTreeMap::new();
        for p in predictions {
            if max_lap.map_or(true, |max| p.lap <= max) {
                by_vehicle.entry(p.vehicle_id.as_str()).or_default().push(p);
            }
        }

        by_vehicle
            .into_iter()
            .flat_map(|(vehicle_id, laps)| self.build_vehicle(vehicle_id, laps))
            .collect()
    }

    /// Series for one vehicle. `laps` may be in any order.
    fn build_vehicle(&self, vehicle_id: &str, mut laps: Vec<&RiskPrediction>) -> Vec<KarmaPoint> {
        laps.sort_by_key(|p| p.lap);

        let mut series: BTreeMap<Component, Vec<KarmaPoint>> = BTreeMap::new();
        for prediction in laps {
            for (&component, &risk) in &prediction.component_predictions {
                let points = series.entry(component).or_default();
                let point = self.next_point(vehicle_id, component, prediction.lap, risk, points);
                points.push(point);
            }
        }

        series.into_values().flatten().collect()
    }

    fn next_point(
        &self,
        vehicle_id: &str,
        component: Component,
        lap: u32,
        risk: f64,
        history: &[KarmaPoint],
    ) -> KarmaPoint {
        let instant = (1.0 - risk).clamp(0.0, 1.0);
        let karma = match history.last() {
            Some(prev) => {
                let s = self.config.smoothing;
                s * prev.karma_score + (1.0 - s) * instant
            }
            None => instant,
        };

        KarmaPoint {
            vehicle_id: vehicle_id.to_string(),
            component,
            lap,
            instant_score: instant,
            karma_score: karma,
            trend: self.trend(lap, karma, history),
        }
    }

    /// Compare with the latest point at least `trend_lookback_laps` earlier.
    fn trend(&self, lap: u32, karma: f64, history: &[KarmaPoint]) -> Trend {
        let Some(cutoff) = lap.checked_sub(self.config.trend_lookback_laps) else {
            return Trend::Stable;
        };
        let Some(reference) = history.iter().rev().find(|p| p.lap <= cutoff) else {
            return Trend::Stable;
        };

        let delta = karma - reference.karma_score;
        if delta > self.config.trend_deadband {
            Trend::Improving
        } else if delta < -self.config.trend_deadband {
            Trend::Degrading
        } else {
            Trend::Stable
        }
    }
}

/// Last point of each component series.
pub fn latest_by_component(points: &[KarmaPoint]) -> BTreeMap<Component, &KarmaPoint> {
    let mut latest: BTreeMap<Component, &KarmaPoint> = BTreeMap::new();
    for p in points {
        match latest.get(&p.component) {
            Some(current) if current.lap >= p.lap => {}
            _ => {
                latest.insert(p.component, p);
            }
        }
    }
    latest
}
