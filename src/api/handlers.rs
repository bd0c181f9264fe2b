//! HTTP handlers.
//!
//! Handlers are thin: they pick the current `ProcessedRace`, run the
//! matching report in the pipeline, and wrap the result in the envelope.
//! Uploads are processed on the blocking pool.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::envelope::{self, ApiError};
use crate::config::KarmaConfig;
use crate::inference::ModelRegistry;
use crate::ingest::{RaceResults, RawTable};
use crate::pipeline::{KarmaPipeline, ProcessedRace, RaceSideTables, UploadSummary};
use crate::storage::ArtifactStore;

// ============================================================================
// State
// ============================================================================

/// Shared state. Config and models are read-only for the process lifetime;
/// the current race and the side tables are swapped by uploads.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<KarmaConfig>,
    pub registry: Arc<ModelRegistry>,
    pub store: Option<ArtifactStore>,
    /// Lap markers and race results applied to every upload.
    pub side: Arc<RwLock<RaceSideTables>>,
    pub race: Arc<RwLock<Option<Arc<ProcessedRace>>>>,
}

impl AppState {
    pub fn new(config: Arc<KarmaConfig>, registry: Arc<ModelRegistry>) -> Self {
        Self {
            config,
            registry,
            store: None,
            side: Arc::new(RwLock::new(RaceSideTables::default())),
            race: Arc::new(RwLock::new(None)),
        }
    }

    /// Persist processed tables to `store` after every upload.
    pub fn with_store(mut self, store: ArtifactStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Lap markers and results loaded at startup.
    pub fn with_side_tables(mut self, side: RaceSideTables) -> Self {
        self.side = Arc::new(RwLock::new(side));
        self
    }

    /// Reload the last persisted race, if any, re-running inference with the
    /// loaded models. Returns the number of laps restored.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let Some(store) = self.store.clone() else {
            return Ok(0);
        };
        let config = Arc::clone(&self.config);
        let registry = Arc::clone(&self.registry);

        let race = tokio::task::spawn_blocking(move || KarmaPipeline::new(&config, &registry).load_stored(&store))
            .await??;

        let laps = race.as_ref().map_or(0, |r| r.features.len());
        if let Some(race) = race {
            tracing::info!(laps, dnf_flags = race.dnf.len(), "Restored processed race from disk");
            *self.race.write().await = Some(Arc::new(race));
        }
        Ok(laps)
    }

    async fn current(&self) -> Result<Arc<ProcessedRace>, ApiError> {
        self.race.read().await.clone().ok_or(ApiError::NoRace)
    }

    fn pipeline(&self) -> KarmaPipeline<'_> {
        KarmaPipeline::new(&self.config, &self.registry)
    }
}

/// Optional replay cutoff.
#[derive(Debug, Default, Deserialize)]
pub struct ReplayQuery {
    #[serde(default)]
    pub max_lap: Option<u32>,
}

fn known_vehicle(race: &ProcessedRace, vehicle_id: &str) -> Result<(), ApiError> {
    if race.has_vehicle(vehicle_id) {
        Ok(())
    } else {
        Err(ApiError::UnknownVehicle(vehicle_id.to_string()))
    }
}

/// Write `race` to `store`. Failures are logged and reported as
/// `persisted: false`.
fn persist(store: Option<&ArtifactStore>, pipeline: &KarmaPipeline<'_>, race: &ProcessedRace) -> bool {
    let Some(store) = store else {
        return false;
    };
    match pipeline.persist(store, race) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, dir = %store.dir().display(), "Failed to persist processed tables");
            false
        }
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub overall_model: bool,
    pub component_models: Vec<&'static str>,
    pub data_loaded: bool,
    pub vehicles: usize,
}

/// GET /api/health
pub async fn get_health(State(state): State<AppState>) -> Response {
    let race = state.current().await.ok();
    envelope::ok(HealthResponse {
        status: "ok",
        overall_model: state.registry.overall().is_some(),
        component_models: state.registry.component_names(),
        data_loaded: race.is_some(),
        vehicles: race.map_or(0, |r| r.vehicles().len()),
    })
}

// ============================================================================
// Upload
// ============================================================================

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    #[serde(flatten)]
    pub summary: UploadSummary,
    pub persisted: bool,
}

/// POST /api/upload (raw CSV body)
pub async fn upload(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    if body.is_empty() {
        return Err(ApiError::EmptyBody);
    }

    let config = Arc::clone(&state.config);
    let registry = Arc::clone(&state.registry);
    let store = state.store.clone();
    let side = state.side.read().await.clone();

    let (race, persisted) = tokio::task::spawn_blocking(move || {
        let table = RawTable::from_bytes(&body)?;
        let pipeline = KarmaPipeline::new(&config, &registry);
        let race = pipeline.process(&table, side.inputs())?;
        let persisted = persist(store.as_ref(), &pipeline, &race);
        Ok::<_, ApiError>((race, persisted))
    })
    .await
    .map_err(|e| ApiError::Internal(format!("upload processing failed: {e}")))??;

    let summary = race.summary();
    tracing::info!(
        vehicles = summary.vehicles.len(),
        laps = summary.total_laps,
        persisted,
        "Upload processed"
    );
    *state.race.write().await = Some(Arc::new(race));
    Ok(envelope::ok(UploadResponse { summary, persisted }))
}

// ============================================================================
// Race results
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    /// DNF flag per vehicle of the current race matched in the results.
    pub dnf: BTreeMap<String, bool>,
    pub unmatched: Vec<String>,
    pub persisted: bool,
}

/// POST /api/results (raw results CSV body)
///
/// Flags the current race and keeps the table for later uploads.
pub async fn upload_results(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    if body.is_empty() {
        return Err(ApiError::EmptyBody);
    }
    let results = RaceResults::from_table(&RawTable::from_bytes(&body)?, &state.config.columns.vehicle)?;
    state.side.write().await.results = Some(results.clone());

    let mut race = ProcessedRace::clone(&*state.current().await?);
    race.apply_results(&results);

    let persisted = match state.store.clone() {
        Some(store) => {
            let meta = race.vehicle_meta();
            tokio::task::spawn_blocking(move || store.save_vehicle_meta(&meta))
                .await
                .map_err(|e| ApiError::Internal(format!("results processing failed: {e}")))?
                .map_err(|e| tracing::error!(error = %e, "Failed to persist vehicle metadata"))
                .is_ok()
        }
        None => false,
    };

    let unmatched: Vec<String> = race
        .vehicles()
        .into_iter()
        .filter(|v| !race.dnf.contains_key(*v))
        .map(str::to_string)
        .collect();
    tracing::info!(matched = race.dnf.len(), unmatched = unmatched.len(), persisted, "Race results applied");

    let response = ResultsResponse {
        dnf: race.dnf.clone(),
        unmatched,
        persisted,
    };
    *state.race.write().await = Some(Arc::new(race));
    Ok(envelope::ok(response))
}

// ============================================================================
// Vehicles
// ============================================================================

#[derive(Debug, Serialize)]
pub struct VehicleSummary {
    pub vehicle_id: String,
    pub laps: usize,
    pub min_lap: Option<u32>,
    pub max_lap: Option<u32>,
}

/// GET /api/vehicles
pub async fn list_vehicles(State(state): State<AppState>) -> Response {
    let Ok(race) = state.current().await else {
        return envelope::ok(Vec::<VehicleSummary>::new());
    };
    let vehicles: Vec<VehicleSummary> = race
        .vehicles()
        .into_iter()
        .map(|v| {
            let laps = race.features_for(v, None);
            VehicleSummary {
                vehicle_id: v.to_string(),
                laps: laps.len(),
                min_lap: laps.iter().map(|l| l.lap).min(),
                max_lap: laps.iter().map(|l| l.lap).max(),
            }
        })
        .collect();
    envelope::ok(vehicles)
}

/// GET /api/vehicle/:id?max_lap=
pub async fn get_vehicle(
    State(state): State<AppState>,
    Path(vehicle_id): Path<String>,
    Query(query): Query<ReplayQuery>,
) -> Result<Response, ApiError> {
    let race = state.current().await?;
    state
        .pipeline()
        .vehicle_report(&race, &vehicle_id, query.max_lap)
        .map(envelope::ok)
        .ok_or(ApiError::UnknownVehicle(vehicle_id))
}

// ============================================================================
// Karma
// ============================================================================

/// GET /api/karma/:id?max_lap=
pub async fn get_karma(
    State(state): State<AppState>,
    Path(vehicle_id): Path<String>,
    Query(query): Query<ReplayQuery>,
) -> Result<Response, ApiError> {
    karma_response(&state, &vehicle_id, query.max_lap).await
}

/// GET /api/karma/:id/lap/:max_lap
pub async fn get_karma_at_lap(
    State(state): State<AppState>,
    Path((vehicle_id, max_lap)): Path<(String, u32)>,
) -> Result<Response, ApiError> {
    karma_response(&state, &vehicle_id, Some(max_lap)).await
}

async fn karma_response(state: &AppState, vehicle_id: &str, max_lap: Option<u32>) -> Result<Response, ApiError> {
    let race = state.current().await?;
    known_vehicle(&race, vehicle_id)?;
    Ok(envelope::ok(state.pipeline().karma_report(&race, vehicle_id, max_lap)))
}

// ============================================================================
// Model predictions
// ============================================================================

/// GET /api/model-prediction/:id?max_lap=
pub async fn get_model_prediction(
    State(state): State<AppState>,
    Path(vehicle_id): Path<String>,
    Query(query): Query<ReplayQuery>,
) -> Result<Response, ApiError> {
    if !state.registry.has_any() {
        return Err(ApiError::NoModel);
    }
    let race = state.current().await?;
    known_vehicle(&race, &vehicle_id)?;
    Ok(envelope::ok(state.pipeline().prediction_report(&race, &vehicle_id, query.max_lap)))
}
