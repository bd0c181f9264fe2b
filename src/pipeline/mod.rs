//! Karma Pipeline
//!
//! ```text
//! RawTable ─► SchemaNormalizer ─► LapAssigner ─► FeatureAggregator
//!                                                      │
//!            KarmaStreamBuilder ◄── RiskEngine ◄───────┘
//! ```
//!
//! Each stage consumes only the previous stage's output. One call processes
//! one file; the returned `ProcessedRace` is immutable and karma is derived
//! from it on demand for any `max_lap`.

mod diagnostics;
pub mod report;

pub use diagnostics::{DataIntegrityWarning, Diagnostics, PipelineWarning};
pub use report::{KarmaReport, PredictionReport, UploadSummary, VehicleMetrics, VehicleReport};

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::KarmaConfig;
use crate::features::FeatureAggregator;
use crate::inference::{ModelRegistry, RiskEngine};
use crate::ingest::{LapBoundaries, RaceResults, RawTable, SchemaError, SchemaNormalizer, TableShape};
use crate::karma::KarmaStreamBuilder;
use crate::laps::LapAssigner;
use crate::storage::{ArtifactStore, StorageError, VehicleMeta};
use crate::types::{KarmaPoint, LapAssignment, LapFeatureVector, RiskPrediction};

/// Optional side inputs of a processing run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SideInputs<'a> {
    pub boundaries: Option<&'a LapBoundaries>,
    pub results: Option<&'a RaceResults>,
}

/// Owned side tables, kept by long-lived callers such as the HTTP state.
#[derive(Debug, Clone, Default)]
pub struct RaceSideTables {
    pub boundaries: Option<LapBoundaries>,
    pub results: Option<RaceResults>,
}

impl RaceSideTables {
    pub fn inputs(&self) -> SideInputs<'_> {
        SideInputs {
            boundaries: self.boundaries.as_ref(),
            results: self.results.as_ref(),
        }
    }
}

/// Outcome of processing one telemetry file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessedRace {
    /// Sorted by vehicle, lap.
    pub features: Vec<LapFeatureVector>,
    /// Same order as `features`.
    pub predictions: Vec<RiskPrediction>,
    pub lap_assignment: BTreeMap<String, LapAssignment>,
    pub dnf: BTreeMap<String, bool>,
    /// Car number per vehicle, from the telemetry's number column.
    pub vehicle_numbers: BTreeMap<String, String>,
    pub shape: Option<TableShape>,
    pub source_rows: usize,
    pub diagnostics: Diagnostics,
}

impl ProcessedRace {
    pub fn vehicles(&self) -> BTreeSet<&str> {
        self.features.iter().map(|f| f.vehicle_id.as_str()).collect()
    }

    pub fn has_vehicle(&self, vehicle_id: &str) -> bool {
        self.features.iter().any(|f| f.vehicle_id == vehicle_id)
    }

    /// Feature vectors of one vehicle with laps `<= max_lap`.
    pub fn features_for(&self, vehicle_id: &str, max_lap: Option<u32>) -> Vec<&LapFeatureVector> {
        self.features
            .iter()
            .filter(|f| f.vehicle_id == vehicle_id && within(f.lap, max_lap))
            .collect()
    }

    /// Predictions of one vehicle with laps `<= max_lap`.
    pub fn predictions_for(&self, vehicle_id: &str, max_lap: Option<u32>) -> Vec<&RiskPrediction> {
        self.predictions
            .iter()
            .filter(|p| p.vehicle_id == vehicle_id && within(p.lap, max_lap))
            .collect()
    }

    /// Re-derive DNF flags for every vehicle from a results table.
    pub fn apply_results(&mut self, results: &RaceResults) {
        let vehicles: BTreeSet<String> = self
            .vehicles()
            .into_iter()
            .map(str::to_string)
            .chain(self.lap_assignment.keys().cloned())
            .collect();
        self.dnf = vehicles
            .into_iter()
            .filter_map(|v| {
                let number = self.vehicle_numbers.get(&v).map(String::as_str);
                results.is_dnf(&v, number).map(|flag| (v, flag))
            })
            .collect();
    }

    /// One metadata row per vehicle seen in features or lap assignment.
    pub fn vehicle_meta(&self) -> Vec<VehicleMeta> {
        let vehicles: BTreeSet<&str> = self
            .vehicles()
            .into_iter()
            .chain(self.lap_assignment.keys().map(String::as_str))
            .collect();
        vehicles
            .into_iter()
            .map(|v| VehicleMeta {
                vehicle_id: v.to_string(),
                vehicle_number: self.vehicle_numbers.get(v).cloned(),
                lap_assignment: self.lap_assignment.get(v).copied(),
                dnf_flag: self.dnf.get(v).copied(),
            })
            .collect()
    }

    fn restore_meta(&mut self, vehicles: Vec<VehicleMeta>) {
        for meta in vehicles {
            if let Some(number) = meta.vehicle_number {
                self.vehicle_numbers.insert(meta.vehicle_id.clone(), number);
            }
            if let Some(strategy) = meta.lap_assignment {
                self.lap_assignment.insert(meta.vehicle_id.clone(), strategy);
            }
            if let Some(flag) = meta.dnf_flag {
                self.dnf.insert(meta.vehicle_id, flag);
            }
        }
    }

    /// Upload summary returned to the caller.
    pub fn summary(&self) -> UploadSummary {
        UploadSummary {
            vehicles: self.vehicles().into_iter().map(str::to_string).collect(),
            rows_processed: self.source_rows,
            total_laps: self.features.len(),
            min_lap: self.features.iter().map(|f| f.lap).min(),
            max_lap: self.features.iter().map(|f| f.lap).max(),
            warnings: self.diagnostics.messages(),
        }
    }
}

fn within(lap: u32, max_lap: Option<u32>) -> bool {
    max_lap.map_or(true, |max| lap <= max)
}

/// Stage runner bound to one config and one model registry.
pub struct KarmaPipeline<'a> {
    config: &'a KarmaConfig,
    registry: &'a ModelRegistry,
}

impl<'a> KarmaPipeline<'a> {
    pub fn new(config: &'a KarmaConfig, registry: &'a ModelRegistry) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &KarmaConfig {
        self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        self.registry
    }

    /// Run every stage over one raw telemetry table.
    pub fn process(&self, telemetry: &RawTable, side: SideInputs<'_>) -> Result<ProcessedRace, SchemaError> {
        let mut diag = Diagnostics::new();

        // Stage 1: normalize
        let normalized = SchemaNormalizer::from_config(self.config).normalize(telemetry, &mut diag)?;
        let shape = normalized.shape;
        let source_rows = normalized.source_rows;
        let vehicle_numbers = normalized.vehicle_numbers.clone();

        // Stage 2: laps
        let mut assigner = LapAssigner::new(self.config.laps.window_seconds);
        if let Some(boundaries) = side.boundaries {
            assigner = assigner.with_boundaries(boundaries);
        }
        let assigned = assigner.assign(normalized, &mut diag)?;

        // Stage 3: aggregate
        let features = FeatureAggregator::new(&self.config.aggregation).aggregate(&assigned.rows);

        // Stage 4: infer
        let mut race = self.infer(features, &mut diag);
        race.lap_assignment = assigned.strategies;
        race.vehicle_numbers = vehicle_numbers;
        if let Some(results) = side.results {
            race.apply_results(results);
        }
        race.shape = Some(shape);
        race.source_rows = source_rows;
        race.diagnostics = diag;

        tracing::info!(
            vehicles = race.vehicles().len(),
            laps = race.features.len(),
            warnings = race.diagnostics.len(),
            approximate = assigned_is_approximate(&race.lap_assignment),
            "Telemetry processed"
        );
        Ok(race)
    }

    /// Risk inference over already-aggregated features.
    pub fn infer(&self, features: Vec<LapFeatureVector>, diag: &mut Diagnostics) -> ProcessedRace {
        let predictions =
            RiskEngine::new(self.registry, &self.config.inference).predict_all(&features, diag);
        ProcessedRace {
            source_rows: features.iter().map(|f| f.samples_per_lap).sum(),
            features,
            predictions,
            ..ProcessedRace::default()
        }
    }

    /// Write every processed table of `race` to `store`.
    pub fn persist(&self, store: &ArtifactStore, race: &ProcessedRace) -> Result<(), StorageError> {
        let karma = self.karma(race, None);
        store.save_features(&race.features)?;
        store.save_predictions(&race.predictions)?;
        store.save_karma(&karma)?;
        store.save_vehicle_meta(&race.vehicle_meta())?;
        tracing::info!(
            dir = %store.dir().display(),
            laps = race.features.len(),
            karma_points = karma.len(),
            "Processed tables persisted"
        );
        Ok(())
    }

    /// Rebuild a race from the stored feature and vehicle tables.
    ///
    /// `Ok(None)` when nothing has been persisted yet. Predictions are
    /// recomputed with the current registry.
    pub fn load_stored(&self, store: &ArtifactStore) -> Result<Option<ProcessedRace>, StorageError> {
        let Some(features) = store.load_features()? else {
            return Ok(None);
        };
        let mut diag = Diagnostics::new();
        let mut race = self.infer(features, &mut diag);
        race.diagnostics = diag;
        if let Some(vehicles) = store.load_vehicle_meta()? {
            race.restore_meta(vehicles);
        }
        Ok(Some(race))
    }

    /// Stage 5: karma series for every vehicle, laps `<= max_lap`.
    pub fn karma(&self, race: &ProcessedRace, max_lap: Option<u32>) -> Vec<KarmaPoint> {
        KarmaStreamBuilder::new(&self.config.karma).build(&race.predictions, max_lap)
    }

    /// Karma series for one vehicle, recomputed from scratch.
    pub fn vehicle_karma(&self, race: &ProcessedRace, vehicle_id: &str, max_lap: Option<u32>) -> Vec<KarmaPoint> {
        let predictions: Vec<RiskPrediction> = race
            .predictions_for(vehicle_id, max_lap)
            .into_iter()
            .cloned()
            .collect();
        KarmaStreamBuilder::new(&self.config.karma).build(&predictions, max_lap)
    }
}

fn assigned_is_approximate(strategies: &BTreeMap<String, LapAssignment>) -> bool {
    strategies.values().any(|s| s.is_approximate())
}
