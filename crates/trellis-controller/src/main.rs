//! Trellis Controller
//!
//! Single binary that runs:
//! - the telemetry ingest + route computation HTTP API
//! - the health endpoint
//! - the stale-record cleaner
//!
//! The controller is stateless with respect to disk: its whole world is
//! the live telemetry stream. Restarting it merely means agents repopulate
//! the topology within one telemetry interval.

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use trellis_controller::config::ControllerConfig;
use trellis_controller::state::AppState;
use trellis_controller::{api, cleaner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────
    let config = ControllerConfig::from_env()?;
    tracing::info!(
        penalty_factor = config.penalty_factor,
        hysteresis = config.hysteresis,
        stale_threshold_s = config.stale_threshold.as_secs(),
        "trellis-controller starting"
    );

    // ── Shared state ────────────────────────────────────────────
    let state = AppState::new(config.clone());

    // ── Cleaner ─────────────────────────────────────────────────
    tokio::spawn(cleaner::run(state.clone()));

    // ── Router ──────────────────────────────────────────────────
    let app = api::router()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    // ── Listen ──────────────────────────────────────────────────
    tracing::info!("trellis-controller listening on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
