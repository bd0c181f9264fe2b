//! REST API module using Axum
//!
//! Thin HTTP boundary over the karma pipeline. All endpoints live under
//! `/api` and answer with the `{data, meta}` / `{error, meta}` envelope.

pub mod envelope;
pub mod handlers;
mod routes;

pub use envelope::ApiError;
pub use handlers::AppState;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, Method};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Environment variable with a comma-separated list of allowed origins.
pub const CORS_ENV_VAR: &str = "KARMA_CORS_ORIGINS";

/// CORS: configured origins when `KARMA_CORS_ORIGINS` is set, any origin
/// otherwise (the dashboard is served from a separate dev server).
fn build_cors_layer() -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    match std::env::var(CORS_ENV_VAR) {
        Ok(origins) => {
            let allowed: Vec<_> = origins
                .split(',')
                .filter_map(|o| o.trim().parse().ok())
                .collect();
            tracing::info!(origins = %origins, "CORS: allowing configured origins");
            base.allow_origin(allowed)
        }
        Err(_) => base.allow_origin(Any),
    }
}

/// Create the complete application router.
pub fn create_app(state: AppState) -> Router {
    let max_upload = state.config.server.max_upload_bytes;

    Router::new()
        .nest("/api", routes::api_routes(state))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer())
}
