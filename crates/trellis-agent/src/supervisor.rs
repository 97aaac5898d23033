//! Agent supervisor.
//!
//! Owns the two periodic loops — push telemetry, pull routes — and the
//! graceful shutdown sequence. The loops never die on errors: every
//! failure either retries next tick or trips the fallback latch, which
//! withdraws all overrides and leaves the tunnel defaults in charge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use trellis_common::telemetry::TelemetryReport;

use crate::client::ControllerClient;
use crate::executor::RouteExecutor;
use crate::ping::Pinger;
use crate::prober::Prober;
use crate::routeops::RouteOps;

pub struct Supervisor<P: Pinger, R: RouteOps> {
    agent_id: String,
    prober: Arc<Prober<P>>,
    client: Arc<ControllerClient>,
    executor: Arc<RouteExecutor<R>>,
    sync_interval: Duration,
    /// Set during shutdown: ticks stop producing new work while
    /// in-flight requests drain.
    draining: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<P: Pinger, R: RouteOps> Supervisor<P, R> {
    pub fn new(
        agent_id: String,
        prober: Arc<Prober<P>>,
        client: Arc<ControllerClient>,
        executor: Arc<RouteExecutor<R>>,
        sync_interval: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            agent_id,
            prober,
            client,
            executor,
            sync_interval,
            draining: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Start the prober and both supervisor loops.
    pub async fn start(&self) {
        self.prober.start().await;

        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        tasks.push(tokio::spawn(telemetry_loop(
            self.agent_id.clone(),
            self.prober.clone(),
            self.client.clone(),
            self.executor.clone(),
            self.sync_interval,
            self.draining.clone(),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(sync_loop(
            self.agent_id.clone(),
            self.client.clone(),
            self.executor.clone(),
            self.sync_interval,
            self.draining.clone(),
            self.shutdown_tx.subscribe(),
        )));
        tracing::info!(
            sync_interval_s = self.sync_interval.as_secs_f64(),
            "supervisor started"
        );
    }

    /// Graceful shutdown: gate new work, stop the loops, drain in-flight
    /// requests bounded by `deadline`, then withdraw every managed
    /// route. Cleanup errors are logged and never abort later steps.
    pub async fn shutdown(&self, deadline: Duration) {
        tracing::info!(deadline_s = deadline.as_secs(), "shutting down");
        let deadline_at = tokio::time::Instant::now() + deadline;

        self.draining.store(true, Ordering::Release);
        self.prober.stop().await;
        let _ = self.shutdown_tx.send(true);

        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            let remaining = deadline_at.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                tracing::warn!("supervisor task did not drain before deadline");
            }
        }
        drop(tasks);

        let (cleaned, errors) = self.executor.cleanup_managed_routes().await;
        for e in &errors {
            tracing::warn!(error = %e, "route cleanup failed");
        }
        tracing::info!(cleaned, errors = errors.len(), "shutdown complete");
    }
}

async fn telemetry_loop<P: Pinger, R: RouteOps>(
    agent_id: String,
    prober: Arc<Prober<P>>,
    client: Arc<ControllerClient>,
    executor: Arc<RouteExecutor<R>>,
    interval: Duration,
    draining: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if draining.load(Ordering::Acquire) {
                    continue;
                }
                let metrics = prober.smoothed_metrics();
                if metrics.is_empty() {
                    tracing::debug!("no peers configured, skipping telemetry");
                    continue;
                }
                let report = TelemetryReport {
                    agent_id: agent_id.clone(),
                    timestamp: Utc::now().timestamp(),
                    metrics,
                };
                match client.send_telemetry(&report).await {
                    Ok(()) => tracing::trace!(metrics = report.metrics.len(), "telemetry pushed"),
                    Err(e) => {
                        tracing::warn!(error = %e, "telemetry push failed");
                        maybe_enter_fallback(&client, &executor).await;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn sync_loop<R: RouteOps>(
    agent_id: String,
    client: Arc<ControllerClient>,
    executor: Arc<RouteExecutor<R>>,
    interval: Duration,
    draining: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if draining.load(Ordering::Acquire) {
                    continue;
                }
                if client.is_in_fallback() {
                    // Overrides are already withdrawn; just watch for the
                    // controller to come back.
                    if client.check_health().await.is_ok() {
                        client.reset_failure_count();
                        tracing::info!("controller healthy again, resuming route sync");
                    }
                    continue;
                }
                match client.get_routes(&agent_id).await {
                    Ok(routes) => {
                        executor.sync_routes(&routes).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "route fetch failed");
                        maybe_enter_fallback(&client, &executor).await;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Trip the latch once the failure budget is spent: mark fallback and
/// withdraw everything we installed.
async fn maybe_enter_fallback<R: RouteOps>(
    client: &ControllerClient,
    executor: &RouteExecutor<R>,
) {
    if client.should_enter_fallback() {
        client.enter_fallback();
        executor.flush_routes().await;
    }
}
