//! API route definitions
//!
//! - /health - liveness plus loaded models
//! - /upload - process a raw telemetry CSV
//! - /results - race results CSV, sets DNF flags
//! - /vehicles - vehicles in the current race
//! - /vehicle/:id - full per-vehicle report
//! - /karma/:id, /karma/:id/lap/:max_lap - karma series
//! - /model-prediction/:id - risk history

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::{self, AppState};

pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::get_health))
        .route("/upload", post(handlers::upload))
        .route("/results", post(handlers::upload_results))
        .route("/vehicles", get(handlers::list_vehicles))
        .route("/vehicle/:id", get(handlers::get_vehicle))
        .route("/karma/:id", get(handlers::get_karma))
        .route("/karma/:id/lap/:max_lap", get(handlers::get_karma_at_lap))
        .route("/model-prediction/:id", get(handlers::get_model_prediction))
        .with_state(state)
}
