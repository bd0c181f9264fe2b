//! JSON bodies of the HTTP API.
//!
//! Success is `{ "data": ..., "meta": ... }`. Failure is
//! `{ "error": { "code", "message" }, "meta": ... }` and always comes from an
//! [`ApiError`], which fixes the status and code of each failure kind.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::ingest::SchemaError;

#[derive(Debug, Serialize)]
struct Meta {
    timestamp: String,
    version: &'static str,
}

impl Meta {
    fn now() -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

#[derive(Serialize)]
struct DataBody<T> {
    data: T,
    meta: Meta,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
    meta: Meta,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    code: &'static str,
    message: &'a str,
}

/// 200 with `data` wrapped in the envelope.
pub fn ok<T: Serialize>(data: T) -> Response {
    Json(DataBody { data, meta: Meta::now() }).into_response()
}

/// Every way a request can fail.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("no telemetry has been processed yet; POST a CSV to /api/upload")]
    NoRace,

    #[error("vehicle '{0}' not found")]
    UnknownVehicle(String),

    #[error("no risk model is loaded")]
    NoModel,

    #[error("empty request body")]
    EmptyBody,

    /// Uploaded file rejected by ingestion.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NoRace | ApiError::UnknownVehicle(_) | ApiError::NoModel => StatusCode::NOT_FOUND,
            ApiError::EmptyBody | ApiError::Schema(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NoRace => "NO_DATA",
            ApiError::UnknownVehicle(_) => "UNKNOWN_VEHICLE",
            ApiError::NoModel => "NO_MODEL",
            ApiError::EmptyBody => "EMPTY_BODY",
            ApiError::Schema(e) => e.code(),
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self, "Request rejected");
        }
        let message = self.to_string();
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code(),
                message: &message,
            },
            meta: Meta::now(),
        };
        (status, Json(body)).into_response()
    }
}
