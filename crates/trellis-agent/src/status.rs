//! Agent-local status HTTP server.
//!
//! Serves `/health` and `/metrics` on a loopback port so operators and
//! Prometheus can inspect one node without going through the controller.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;

use trellis_common::health::{ComponentHealth, HealthReport, HealthState};
use trellis_common::metrics::render_prometheus;

use crate::client::ControllerClient;
use crate::executor::RouteExecutor;
use crate::ping::Pinger;
use crate::prober::Prober;
use crate::routeops::RouteOps;

pub struct StatusState<P: Pinger, R: RouteOps> {
    pub agent_id: String,
    pub probe_interval: Duration,
    pub prober: Arc<Prober<P>>,
    pub client: Arc<ControllerClient>,
    pub executor: Arc<RouteExecutor<R>>,
}

/// Start the status server. Runs until the process exits.
pub async fn run<P: Pinger, R: RouteOps>(
    state: Arc<StatusState<P, R>>,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_handler::<P, R>))
        .route("/metrics", get(metrics_handler::<P, R>))
        .with_state(state);

    tracing::info!(%addr, "status server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler<P: Pinger, R: RouteOps>(
    State(state): State<Arc<StatusState<P, R>>>,
) -> (StatusCode, Json<HealthReport>) {
    let mut components = BTreeMap::new();

    let last_probe = state.prober.last_probe_time();
    let success_rate = state.prober.success_rate();
    let prober_status = if !state.prober.is_running() {
        HealthState::Unhealthy
    } else {
        let fresh = last_probe
            .map(|t| Utc::now() - t < chrono::Duration::from_std(state.probe_interval * 3).unwrap_or(chrono::Duration::MAX))
            .unwrap_or(false);
        if !fresh || success_rate.unwrap_or(0.0) < 0.5 {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    };
    components.insert(
        "prober".to_string(),
        ComponentHealth::new(
            prober_status,
            serde_json::json!({
                "running": state.prober.is_running(),
                "last_probe": last_probe,
                "success_rate": success_rate,
            }),
        ),
    );

    let in_fallback = state.client.is_in_fallback();
    components.insert(
        "controller_link".to_string(),
        ComponentHealth::new(
            if in_fallback {
                HealthState::Degraded
            } else {
                HealthState::Healthy
            },
            serde_json::json!({
                "in_fallback": in_fallback,
                "consecutive_failures": state.client.failure_count(),
            }),
        ),
    );

    components.insert(
        "route_executor".to_string(),
        ComponentHealth::new(
            HealthState::Healthy,
            serde_json::json!({
                "managed_routes": state.executor.managed_count().await,
            }),
        ),
    );

    let report = HealthReport::from_components(components);
    tracing::trace!(agent_id = %state.agent_id, status = ?report.status, "health probed");
    let code = if report.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report))
}

async fn metrics_handler<P: Pinger, R: RouteOps>(
    State(state): State<Arc<StatusState<P, R>>>,
) -> impl IntoResponse {
    let body = render_prometheus(&state.prober.smoothed_metrics());
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use trellis_common::net::TunnelSubnet;

    use crate::ping::SimulatedPinger;
    use crate::routeops::MemRouteOps;

    fn status_state() -> Arc<StatusState<SimulatedPinger, MemRouteOps>> {
        let prober = Arc::new(Prober::new(
            SimulatedPinger,
            vec![Ipv4Addr::new(10, 254, 0, 2)],
            Duration::from_millis(10),
            Duration::from_millis(5),
            10,
        ));
        let client = Arc::new(
            ControllerClient::new(
                "http://127.0.0.1:1",
                Duration::from_millis(100),
                3,
                vec![Duration::ZERO],
            )
            .unwrap(),
        );
        let executor = Arc::new(RouteExecutor::new(
            MemRouteOps::default(),
            TunnelSubnet::default_overlay(),
            Ipv4Addr::new(10, 254, 0, 1),
        ));
        Arc::new(StatusState {
            agent_id: "10.254.0.1".into(),
            probe_interval: Duration::from_millis(10),
            prober,
            client,
            executor,
        })
    }

    #[tokio::test]
    async fn stopped_prober_makes_agent_unhealthy() {
        let state = status_state();
        let (code, Json(report)) = health_handler(State(state)).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(report.status, HealthState::Unhealthy);
        assert_eq!(
            report.components["prober"].status,
            HealthState::Unhealthy
        );
    }

    #[tokio::test]
    async fn running_prober_with_fresh_samples_is_healthy() {
        let state = status_state();
        state.prober.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (code, Json(report)) = health_handler(State(state.clone())).await;
        assert_eq!(code, StatusCode::OK);
        assert_ne!(report.status, HealthState::Unhealthy);
        assert_eq!(
            report.components["route_executor"].details["managed_routes"],
            0
        );

        state.prober.stop().await;
    }

    #[tokio::test]
    async fn fallback_degrades_the_controller_link() {
        let state = status_state();
        state.client.enter_fallback();
        let (_, Json(report)) = health_handler(State(state)).await;
        assert_eq!(
            report.components["controller_link"].status,
            HealthState::Degraded
        );
    }
}
