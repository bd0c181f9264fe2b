//! API Regression Tests
//!
//! Drives the full router (`create_app`) with `oneshot` requests: upload a
//! CSV, then read it back through the vehicle, karma and prediction
//! endpoints. Every response must use the `{data, meta}` / `{error, meta}`
//! envelope.

use mechanical_karma::api::{create_app, AppState};
use mechanical_karma::config::KarmaConfig;
use mechanical_karma::inference::{LoadedModel, LogisticModel, ModelArtifact, ModelRegistry};
use mechanical_karma::ingest::{RaceResults, RawTable};
use mechanical_karma::{ArtifactStore, Component, RaceSideTables};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower::ServiceExt;

const RACE_CSV: &str = "\
vehicle_id,meta_time,lap,speed,nmot,pbrake_f
GR86-002,2024-05-04T14:00:00Z,1,100,5000,10
GR86-002,2024-05-04T14:00:01Z,1,102,5100,12
GR86-002,2024-05-04T14:01:40Z,2,120,6000,20
GR86-002,2024-05-04T14:01:41Z,2,124,6100,22
GR86-002,2024-05-04T14:03:20Z,3,130,6500,30
GR86-004,2024-05-04T14:00:00Z,1,95,4900,8
";

fn logistic(feature: &str, weight: f64, intercept: f64) -> ModelArtifact {
    ModelArtifact::Logistic(LogisticModel {
        features: vec![feature.to_string()],
        defaults: BTreeMap::new(),
        coefficients: vec![weight],
        intercept,
    })
}

fn registry() -> ModelRegistry {
    let model = |name: &str, artifact| LoadedModel::new(name, artifact, None).unwrap();
    ModelRegistry::empty()
        .with_overall(model("overall", logistic("speed_mean", 0.02, -3.0)))
        .with_component(Component::Engine, model("engine", logistic("nmot_max", 0.0005, -3.5)))
        .with_component(Component::Brakes, model("brakes", logistic("pbrake_f_max", 0.05, -2.0)))
}

fn app_with(registry: ModelRegistry) -> Router {
    create_app(AppState::new(Arc::new(KarmaConfig::default()), Arc::new(registry)))
}

async fn send(app: &Router, method: &str, uri: &str, body: Body) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().method(method).uri(uri).body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    send(app, "GET", uri, Body::empty()).await
}

async fn uploaded_app() -> Router {
    let app = app_with(registry());
    let (status, json) = send(&app, "POST", "/api/upload", Body::from(RACE_CSV)).await;
    assert_eq!(status, StatusCode::OK, "upload failed: {json}");
    app
}

// ============================================================================
// Health and empty state
// ============================================================================

#[tokio::test]
async fn test_health_reports_loaded_models() {
    let app = app_with(registry());
    let (status, json) = get(&app, "/api/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["status"], "ok");
    assert_eq!(json["data"]["overall_model"], true);
    assert_eq!(json["data"]["data_loaded"], false);
    assert!(json["meta"]["timestamp"].is_string());
    let components = json["data"]["component_models"].as_array().unwrap();
    assert_eq!(components.len(), 2);
}

#[tokio::test]
async fn test_endpoints_before_upload() {
    let app = app_with(registry());

    let (status, json) = get(&app, "/api/vehicles").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"].as_array().unwrap().len(), 0);

    for uri in ["/api/vehicle/GR86-002", "/api/karma/GR86-002", "/api/model-prediction/GR86-002"] {
        let (status, json) = get(&app, uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(json["error"]["code"], "NO_DATA", "{uri}");
    }
}

// ============================================================================
// Upload
// ============================================================================

#[tokio::test]
async fn test_upload_returns_summary() {
    let app = app_with(registry());
    let (status, json) = send(&app, "POST", "/api/upload", Body::from(RACE_CSV)).await;

    assert_eq!(status, StatusCode::OK);
    let data = &json["data"];
    assert_eq!(data["vehicles"], serde_json::json!(["GR86-002", "GR86-004"]));
    assert_eq!(data["rows_processed"], 6);
    assert_eq!(data["total_laps"], 4);
    assert_eq!(data["min_lap"], 1);
    assert_eq!(data["max_lap"], 3);
    assert_eq!(data["persisted"], false);
}

#[tokio::test]
async fn test_upload_schema_error_is_400() {
    let app = app_with(registry());
    let (status, json) = send(&app, "POST", "/api/upload", Body::from("car,speed\nA,1\n")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "MISSING_VEHICLE_COLUMN");
    assert!(json["error"]["message"].as_str().unwrap().contains("vehicle_id"));
}

#[tokio::test]
async fn test_upload_persists_when_store_configured() {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::new(Arc::new(KarmaConfig::default()), Arc::new(registry()))
        .with_store(ArtifactStore::new(dir.path()));
    let app = create_app(state.clone());

    let (status, json) = send(&app, "POST", "/api/upload", Body::from(RACE_CSV)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["persisted"], true);
    assert!(dir.path().join("per_lap_features.csv").exists());
    assert!(dir.path().join("risk_predictions.csv").exists());
    assert!(dir.path().join("karma_stream.csv").exists());

    // A fresh process restores the same laps from disk
    let restored = AppState::new(Arc::new(KarmaConfig::default()), Arc::new(registry()))
        .with_store(ArtifactStore::new(dir.path()));
    assert_eq!(restored.restore().await.unwrap(), 4);
    let app = create_app(restored);
    let (status, json) = get(&app, "/api/karma/GR86-002").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["max_lap"], serde_json::Value::Null);
}

// ============================================================================
// Vehicle, karma, predictions
// ============================================================================

#[tokio::test]
async fn test_vehicle_report() {
    let app = uploaded_app().await;
    let (status, json) = get(&app, "/api/vehicle/GR86-002").await;

    assert_eq!(status, StatusCode::OK);
    let data = &json["data"];
    assert_eq!(data["vehicle_id"], "GR86-002");
    assert_eq!(data["metrics"]["laps_recorded"], 3);
    assert_eq!(data["metrics"]["max_speed"], 130.0);
    assert_eq!(data["laps"].as_array().unwrap().len(), 3);

    let (status, json) = get(&app, "/api/vehicle/NOPE").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "UNKNOWN_VEHICLE");
}

#[tokio::test]
async fn test_karma_replay_filters_laps() {
    let app = uploaded_app().await;

    let (status, full) = get(&app, "/api/karma/GR86-002").await;
    assert_eq!(status, StatusCode::OK);
    let full_history = full["data"]["history"].as_array().unwrap().clone();
    assert_eq!(full_history.len(), 6); // 3 laps x 2 components

    let (status, cut) = get(&app, "/api/karma/GR86-002/lap/2").await;
    assert_eq!(status, StatusCode::OK);
    let history = cut["data"]["history"].as_array().unwrap();
    assert_eq!(history.len(), 4);
    assert!(history.iter().all(|p| p["lap"].as_u64().unwrap() <= 2));
    for point in history {
        assert!(full_history.contains(point), "replayed point differs: {point}");
    }

    let (_, query) = get(&app, "/api/karma/GR86-002?max_lap=2").await;
    assert_eq!(query["data"]["history"], cut["data"]["history"]);
}

#[tokio::test]
async fn test_model_prediction_history() {
    let app = uploaded_app().await;
    let (status, json) = get(&app, "/api/model-prediction/GR86-002?max_lap=2").await;

    assert_eq!(status, StatusCode::OK);
    let history = json["data"]["history"].as_array().unwrap();
    assert_eq!(history.len(), 2);
    for p in history {
        let dnf = p["dnf_probability"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&dnf));
        assert!(p["component_predictions"]["engine"].is_number());
        assert!(p["component_predictions"]["brakes"].is_number());
    }
    assert_eq!(json["data"]["latest"]["lap"], 2);
}

#[tokio::test]
async fn test_model_prediction_without_models_is_404() {
    let app = app_with(ModelRegistry::empty());
    let (status, _) = send(&app, "POST", "/api/upload", Body::from(RACE_CSV)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = get(&app, "/api/model-prediction/GR86-002").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "NO_MODEL");

    // Karma still answers with an empty series
    let (status, json) = get(&app, "/api/karma/GR86-002").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["history"].as_array().unwrap().len(), 0);
}

// ============================================================================
// Race results and DNF flags
// ============================================================================

const NUMBERED_CSV: &str = "\
vehicle_id,vehicle_number,meta_time,lap,speed,nmot,pbrake_f
GR86-002-13,13,2024-05-04T14:00:00Z,1,100,5000,10
GR86-002-13,13,2024-05-04T14:01:40Z,2,120,6000,20
GR86-004-7,7,2024-05-04T14:00:00Z,1,95,4900,8
";

const RESULTS_CSV: &str = "POS;NUMBER;STATUS\n1;7;Classified\n2;13;DNF\n";

fn stored_state(dir: &std::path::Path) -> AppState {
    AppState::new(Arc::new(KarmaConfig::default()), Arc::new(registry())).with_store(ArtifactStore::new(dir))
}

#[tokio::test]
async fn test_dnf_flag_survives_restore() {
    let dir = tempfile::tempdir().unwrap();
    let results = RaceResults::from_table(&RawTable::from_bytes(RESULTS_CSV.as_bytes()).unwrap(), "vehicle_id").unwrap();
    let state = stored_state(dir.path()).with_side_tables(RaceSideTables {
        boundaries: None,
        results: Some(results),
    });
    let app = create_app(state);

    let (status, json) = send(&app, "POST", "/api/upload", Body::from(NUMBERED_CSV)).await;
    assert_eq!(status, StatusCode::OK, "{json}");
    let (_, json) = get(&app, "/api/vehicle/GR86-002-13").await;
    assert_eq!(json["data"]["metrics"]["dnf_flag"], true);
    assert!(dir.path().join("vehicle_meta.csv").exists());

    // A fresh process without any results table still knows the DNF
    let restored = stored_state(dir.path());
    assert_eq!(restored.restore().await.unwrap(), 3);
    let app = create_app(restored);
    let (status, json) = get(&app, "/api/vehicle/GR86-002-13").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["metrics"]["dnf_flag"], true);
    assert_eq!(json["data"]["metrics"]["lap_assignment"], "explicit");
    let (_, json) = get(&app, "/api/vehicle/GR86-004-7").await;
    assert_eq!(json["data"]["metrics"]["dnf_flag"], false);
}

#[tokio::test]
async fn test_results_endpoint_flags_current_race() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_app(stored_state(dir.path()));

    let (status, _) = send(&app, "POST", "/api/upload", Body::from(NUMBERED_CSV)).await;
    assert_eq!(status, StatusCode::OK);
    let (_, json) = get(&app, "/api/vehicle/GR86-002-13").await;
    assert_eq!(json["data"]["metrics"]["dnf_flag"], serde_json::Value::Null);

    let (status, json) = send(&app, "POST", "/api/results", Body::from(RESULTS_CSV)).await;
    assert_eq!(status, StatusCode::OK, "{json}");
    assert_eq!(json["data"]["dnf"]["GR86-002-13"], true);
    assert_eq!(json["data"]["dnf"]["GR86-004-7"], false);
    assert_eq!(json["data"]["unmatched"].as_array().unwrap().len(), 0);
    assert_eq!(json["data"]["persisted"], true);

    let (_, json) = get(&app, "/api/vehicle/GR86-002-13").await;
    assert_eq!(json["data"]["metrics"]["dnf_flag"], true);

    // Later uploads reuse the results table
    let (status, _) = send(&app, "POST", "/api/upload", Body::from(NUMBERED_CSV)).await;
    assert_eq!(status, StatusCode::OK);
    let (_, json) = get(&app, "/api/vehicle/GR86-002-13").await;
    assert_eq!(json["data"]["metrics"]["dnf_flag"], true);

    let restored = stored_state(dir.path());
    restored.restore().await.unwrap();
    let (_, json) = get(&create_app(restored), "/api/vehicle/GR86-002-13").await;
    assert_eq!(json["data"]["metrics"]["dnf_flag"], true);
}

#[tokio::test]
async fn test_results_without_key_columns_is_400() {
    let app = uploaded_app().await;
    let (status, json) = send(&app, "POST", "/api/results", Body::from("POS;STATUS\n1;DNF\n")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "MISSING_COLUMN");
}
