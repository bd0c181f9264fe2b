//! Presentation payloads per vehicle.
//!
//! Every report honours the replay window: with `max_lap` set, signals,
//! risk history and karma only cover laps `<= max_lap`, and karma is
//! recomputed as if later laps never happened.

use serde::Serialize;
use std::collections::BTreeMap;

use super::{KarmaPipeline, ProcessedRace};
use crate::karma::latest_by_component;
use crate::types::{
    Component, ComponentRisk, KarmaPoint, LapAssignment, LapFeatureVector, RiskPrediction,
};

const SPEED_MEAN: &str = "speed_mean";
const SPEED_MIN: &str = "speed_min";
const SPEED_MAX: &str = "speed_max";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadSummary {
    pub vehicles: Vec<String>,
    pub rows_processed: usize,
    pub total_laps: usize,
    pub min_lap: Option<u32>,
    pub max_lap: Option<u32>,
    pub warnings: Vec<String>,
}

/// Headline numbers for one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleMetrics {
    pub laps_recorded: usize,
    pub min_lap: Option<u32>,
    pub max_lap: Option<u32>,
    /// `None` when no race results were supplied for the vehicle.
    pub dnf_flag: Option<bool>,
    pub avg_speed: Option<f64>,
    pub min_speed: Option<f64>,
    pub max_speed: Option<f64>,
    pub lap_assignment: Option<LapAssignment>,
}

impl VehicleMetrics {
    fn from_laps(laps: &[&LapFeatureVector], dnf_flag: Option<bool>, lap_assignment: Option<LapAssignment>) -> Self {
        let means: Vec<f64> = laps.iter().filter_map(|l| l.get(SPEED_MEAN)).collect();
        let avg_speed = if means.is_empty() {
            None
        } else {
            Some(means.iter().sum::<f64>() / means.len() as f64)
        };
        let min_speed = laps
            .iter()
            .filter_map(|l| l.get(SPEED_MIN).or_else(|| l.get(SPEED_MEAN)))
            .reduce(f64::min);
        let max_speed = laps
            .iter()
            .filter_map(|l| l.get(SPEED_MAX).or_else(|| l.get(SPEED_MEAN)))
            .reduce(f64::max);

        Self {
            laps_recorded: laps.len(),
            min_lap: laps.iter().map(|l| l.lap).min(),
            max_lap: laps.iter().map(|l| l.lap).max(),
            dnf_flag,
            avg_speed,
            min_speed,
            max_speed,
            lap_assignment,
        }
    }
}

/// Karma series of one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KarmaReport {
    pub vehicle_id: String,
    pub max_lap: Option<u32>,
    /// Latest smoothed score per component.
    pub latest_scores: BTreeMap<Component, f64>,
    pub latest: BTreeMap<Component, KarmaPoint>,
    pub history: Vec<KarmaPoint>,
}

impl KarmaReport {
    pub fn new(vehicle_id: &str, max_lap: Option<u32>, history: Vec<KarmaPoint>) -> Self {
        let latest: BTreeMap<Component, KarmaPoint> = latest_by_component(&history)
            .into_iter()
            .map(|(c, p)| (c, p.clone()))
            .collect();
        Self {
            vehicle_id: vehicle_id.to_string(),
            max_lap,
            latest_scores: latest.iter().map(|(c, p)| (*c, p.karma_score)).collect(),
            latest,
            history,
        }
    }
}

/// Risk history of one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionReport {
    pub vehicle_id: String,
    pub max_lap: Option<u32>,
    pub latest: Option<RiskPrediction>,
    pub most_at_risk_component: Option<ComponentRisk>,
    pub history: Vec<RiskPrediction>,
}

impl PredictionReport {
    pub fn new(vehicle_id: &str, max_lap: Option<u32>, history: Vec<RiskPrediction>) -> Self {
        let latest = history.iter().max_by_key(|p| p.lap).cloned();
        Self {
            vehicle_id: vehicle_id.to_string(),
            max_lap,
            most_at_risk_component: latest.as_ref().and_then(|p| p.most_at_risk_component),
            latest,
            history,
        }
    }
}

/// Everything the presentation layer shows for one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleReport {
    pub vehicle_id: String,
    pub max_lap: Option<u32>,
    pub metrics: VehicleMetrics,
    /// Lap-indexed signal table for charting.
    pub laps: Vec<LapFeatureVector>,
    pub predictions: PredictionReport,
    pub karma: KarmaReport,
}

impl KarmaPipeline<'_> {
    /// `None` when the vehicle has no laps in `race`.
    pub fn vehicle_report(&self, race: &ProcessedRace, vehicle_id: &str, max_lap: Option<u32>) -> Option<VehicleReport> {
        if !race.has_vehicle(vehicle_id) {
            return None;
        }
        let laps = race.features_for(vehicle_id, max_lap);
        let metrics = VehicleMetrics::from_laps(
            &laps,
            race.dnf.get(vehicle_id).copied(),
            race.lap_assignment.get(vehicle_id).copied(),
        );

        Some(VehicleReport {
            vehicle_id: vehicle_id.to_string(),
            max_lap,
            metrics,
            laps: laps.into_iter().cloned().collect(),
            predictions: self.prediction_report(race, vehicle_id, max_lap),
            karma: self.karma_report(race, vehicle_id, max_lap),
        })
    }

    pub fn karma_report(&self, race: &ProcessedRace, vehicle_id: &str, max_lap: Option<u32>) -> KarmaReport {
        KarmaReport::new(vehicle_id, max_lap, self.vehicle_karma(race, vehicle_id, max_lap))
    }

    pub fn prediction_report(&self, race: &ProcessedRace, vehicle_id: &str, max_lap: Option<u32>) -> PredictionReport {
        let history = race
            .predictions_for(vehicle_id, max_lap)
            .into_iter()
            .cloned()
            .collect();
        PredictionReport::new(vehicle_id, max_lap, history)
    }
}
