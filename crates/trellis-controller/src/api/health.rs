//! Controller health endpoint.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;

use trellis_common::health::{ComponentHealth, HealthReport, HealthState};

use crate::state::AppState;

/// Handler for `GET /health`.
///
/// 200 with the full report unless any component is unhealthy, in which
/// case the same body ships with 503.
pub async fn handler(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let mut components = BTreeMap::new();

    // An empty topology is not an error — a freshly started controller
    // has heard from nobody — but it cannot steer anything yet.
    let agents = state.store().count();
    let store_status = if agents == 0 {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    };
    components.insert(
        "topology_store".to_string(),
        ComponentHealth::new(
            store_status,
            serde_json::json!({
                "agents": agents,
                "last_update": state.store().last_update(),
                "reports_accepted": state.reports_accepted(),
            }),
        ),
    );

    components.insert(
        "solver".to_string(),
        ComponentHealth::new(
            HealthState::Healthy,
            serde_json::json!({
                "routes_served": state.routes_served(),
                "published_pairs": state.solver().published_pairs(),
            }),
        ),
    );

    let stats = state.cleaner_stats();
    components.insert(
        "cleaner".to_string(),
        ComponentHealth::new(
            HealthState::Healthy,
            serde_json::json!({
                "runs": stats.runs(),
                "removed_total": stats.removed_total(),
                "last_run": stats.last_run(),
            }),
        ),
    );

    tracing::trace!(uptime_s = (Utc::now() - state.started_at()).num_seconds(), "health probed");

    let report = HealthReport::from_components(components);
    let code = if report.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report))
}
