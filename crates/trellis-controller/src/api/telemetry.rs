//! Telemetry ingest endpoint.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;

use trellis_common::telemetry::TelemetryReport;

use crate::api::ApiError;
use crate::state::AppState;

/// Handler for `POST /api/v1/telemetry`.
///
/// A malformed body or a report violating the wire invariants is
/// rejected with 400 before anything touches the store.
pub async fn ingest(
    State(state): State<AppState>,
    payload: Result<Json<TelemetryReport>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(report) = payload.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;

    report
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    state.store().store_report(&report);
    state.record_report_accepted();
    tracing::debug!(
        agent_id = %report.agent_id,
        metrics = report.metrics.len(),
        "telemetry accepted"
    );

    Ok(Json(serde_json::json!({ "status": "ok" })))
}
