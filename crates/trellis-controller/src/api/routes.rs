//! Route computation endpoint.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use trellis_common::routes::RouteDirective;

use crate::api::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RoutesQuery {
    pub agent_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RoutesResponse {
    /// Always a list, possibly empty, never null.
    pub routes: Vec<RouteDirective>,
}

/// Handler for `GET /api/v1/routes?agent_id=<id>`.
pub async fn get_routes(
    State(state): State<AppState>,
    Query(query): Query<RoutesQuery>,
) -> Result<Json<RoutesResponse>, ApiError> {
    let agent_id = query
        .agent_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("agent_id query parameter is required"))?;

    if !state.store().exists(&agent_id) {
        return Err(ApiError::not_found(
            "Agent not found. Has it sent telemetry?",
        ));
    }

    let routes = state.solver().compute_routes(state.store(), &agent_id);
    state.record_routes_served();
    tracing::debug!(agent_id = %agent_id, directives = routes.len(), "routes served");

    Ok(Json(RoutesResponse { routes }))
}
