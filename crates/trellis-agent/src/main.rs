//! Trellis Agent
//!
//! Per-node daemon of the overlay router.
//!
//! - Probes every peer over the tunnel and smooths the results
//! - Pushes telemetry to the controller, pulls route directives back
//! - Installs `/32` relay routes on the tunnel interface, and withdraws
//!   them all on controller loss or shutdown
//! - Serves local `/health` and `/metrics`
//! - In `--simulate` mode runs against synthetic probes and an
//!   in-memory route table, no privileges needed

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use trellis_agent::client::ControllerClient;
use trellis_agent::config::AgentConfig;
use trellis_agent::executor::RouteExecutor;
use trellis_agent::ping::{Pinger, SimulatedPinger, SystemPinger};
use trellis_agent::prober::Prober;
use trellis_agent::routeops::{IpRouteOps, MemRouteOps, RouteOps};
use trellis_agent::status;
use trellis_agent::supervisor::Supervisor;

/// Trellis per-node overlay routing agent.
#[derive(Parser, Debug)]
#[command(name = "trellis-agent", about = "Trellis per-node overlay routing agent")]
struct Cli {
    /// Path to the agent configuration file.
    #[arg(long, default_value = "/etc/trellis/agent.toml")]
    config: PathBuf,

    /// Override the controller base URL from the config file.
    #[arg(long)]
    controller_url: Option<String>,

    /// Run with simulated probing and an in-memory route table.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Graceful shutdown deadline in seconds.
    #[arg(long, default_value_t = 30)]
    shutdown_deadline: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AgentConfig::load(&cli.config)?;
    if let Some(url) = cli.controller_url {
        config.controller.url = url;
    }
    let deadline = Duration::from_secs(cli.shutdown_deadline);

    tracing::info!(
        agent_id = %config.agent_id,
        controller_url = %config.controller.url,
        peers = config.network.peer_ips.len(),
        simulate = cli.simulate,
        "trellis-agent starting"
    );

    if cli.simulate {
        run(config, SimulatedPinger, MemRouteOps::default(), deadline).await
    } else {
        let ops = IpRouteOps::new(config.network.interface.clone());
        run(config, SystemPinger, ops, deadline).await
    }
}

async fn run<P: Pinger, R: RouteOps>(
    config: AgentConfig,
    pinger: P,
    ops: R,
    deadline: Duration,
) -> anyhow::Result<()> {
    let own_ip = config.own_ip()?;

    let prober = Arc::new(Prober::new(
        pinger,
        config.network.peer_ips.clone(),
        config.probe_interval(),
        config.probe_timeout(),
        config.probe.window_size,
    ));
    let client = Arc::new(ControllerClient::new(
        &config.controller.url,
        config.controller_timeout(),
        config.sync.retry_attempts,
        config.retry_backoff(),
    )?);
    let executor = Arc::new(RouteExecutor::new(ops, config.network.subnet, own_ip));

    let supervisor = Supervisor::new(
        config.agent_id.clone(),
        prober.clone(),
        client.clone(),
        executor.clone(),
        config.sync_interval(),
    );
    supervisor.start().await;

    // ── Status server ───────────────────────────────────────────
    let status_state = Arc::new(status::StatusState {
        agent_id: config.agent_id.clone(),
        probe_interval: config.probe_interval(),
        prober,
        client,
        executor,
    });
    let status_addr = config.status.listen_addr;
    tokio::spawn(async move {
        if let Err(e) = status::run(status_state, status_addr).await {
            tracing::error!(error = %e, "status server failed");
        }
    });

    // ── Shutdown handling ───────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    tracing::info!("received SIGINT, shutting down");
    supervisor.shutdown(deadline).await;

    tracing::info!("trellis-agent stopped");
    Ok(())
}
