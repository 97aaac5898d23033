//! HTTP surface.
//!
//! POST /api/v1/telemetry — ingest one telemetry report
//! GET  /api/v1/routes    — compute directives for one agent
//! GET  /health           — component health, 503 when unhealthy

pub mod health;
pub mod routes;
pub mod telemetry;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::state::AppState;

/// Build the full router. Layers (trace, CORS) are added by the binary.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/telemetry", post(telemetry::ingest))
        .route("/api/v1/routes", get(routes::get_routes))
        .route("/health", get(health::handler))
}

// ── Error type ──────────────────────────────────────────────────────

/// Maps onto the wire error shape `{"detail": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
        }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "detail": self.detail });
        (self.status, Json(body)).into_response()
    }
}
