//! Control-plane HTTP client.
//!
//! Wraps the two controller endpoints with bounded retries and owns the
//! fallback latch: after `max_retries` fully-retried operations fail in
//! a row the agent gives up on the controller, withdraws its overrides,
//! and keeps probing health until the controller answers again. One
//! successful operation of any kind exits fallback.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use trellis_common::routes::RouteDirective;
use trellis_common::telemetry::TelemetryReport;

#[derive(Debug, Error)]
pub enum ClientError {
    /// 404 from the routes endpoint: the controller has no telemetry
    /// from us yet (or evicted us as stale).
    #[error("agent is not known to the controller")]
    NotFound,
    #[error("controller returned HTTP {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

struct LinkState {
    failure_count: u32,
    in_fallback: bool,
}

pub struct ControllerClient {
    http: reqwest::Client,
    base_url: String,
    max_retries: u32,
    backoff: Vec<Duration>,
    state: Mutex<LinkState>,
}

#[derive(Debug, Deserialize)]
struct RoutesResponse {
    routes: Vec<RouteDirective>,
}

impl ControllerClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        max_retries: u32,
        backoff: Vec<Duration>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(max_retries >= 1, "retry attempts must be at least 1");
        anyhow::ensure!(!backoff.is_empty(), "retry backoff must not be empty");
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            http,
            base_url,
            max_retries,
            backoff,
            state: Mutex::new(LinkState {
                failure_count: 0,
                in_fallback: false,
            }),
        })
    }

    /// Push one telemetry report, retrying on any failure.
    pub async fn send_telemetry(&self, report: &TelemetryReport) -> Result<(), ClientError> {
        let url = format!("{}/api/v1/telemetry", self.base_url);
        let http = self.http.clone();
        let report = report.clone();
        self.with_retries("send_telemetry", move || {
            let http = http.clone();
            let url = url.clone();
            let report = report.clone();
            async move {
                let resp = http.post(&url).json(&report).send().await?;
                let status = resp.status();
                if status.is_success() {
                    Ok(())
                } else {
                    Err(ClientError::Status(status.as_u16()))
                }
            }
        })
        .await
    }

    /// Fetch the current directives for this agent, retrying on any
    /// failure. A final 404 is surfaced as [`ClientError::NotFound`].
    pub async fn get_routes(&self, agent_id: &str) -> Result<Vec<RouteDirective>, ClientError> {
        let url = format!("{}/api/v1/routes", self.base_url);
        let http = self.http.clone();
        let agent_id = agent_id.to_string();
        self.with_retries("get_routes", move || {
            let http = http.clone();
            let url = url.clone();
            let agent_id = agent_id.clone();
            async move {
                let resp = http
                    .get(&url)
                    .query(&[("agent_id", agent_id.as_str())])
                    .send()
                    .await?;
                let status = resp.status();
                if status.as_u16() == 404 {
                    Err(ClientError::NotFound)
                } else if status.is_success() {
                    let body: RoutesResponse = resp.json().await?;
                    Ok(body.routes)
                } else {
                    Err(ClientError::Status(status.as_u16()))
                }
            }
        })
        .await
    }

    /// Single-attempt health probe, used to detect recovery while in
    /// fallback. Success counts as an operation success and exits
    /// fallback.
    pub async fn check_health(&self) -> Result<(), ClientError> {
        let attempt = async {
            let resp = self
                .http
                .get(format!("{}/health", self.base_url))
                .send()
                .await?;
            let status = resp.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(ClientError::Status(status.as_u16()))
            }
        };
        match attempt.await {
            Ok(()) => {
                self.record_success();
                Ok(())
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    // ── Fallback latch ──────────────────────────────────────────

    /// True once enough consecutive operations have failed that the
    /// agent should withdraw its overrides.
    pub fn should_enter_fallback(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.in_fallback && state.failure_count >= self.max_retries
    }

    pub fn enter_fallback(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.in_fallback {
            state.in_fallback = true;
            tracing::warn!(
                failures = state.failure_count,
                "lost controller contact, entering fallback"
            );
        }
    }

    pub fn is_in_fallback(&self) -> bool {
        self.state.lock().unwrap().in_fallback
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().unwrap().failure_count
    }

    pub fn reset_failure_count(&self) {
        self.state.lock().unwrap().failure_count = 0;
    }

    fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        if state.in_fallback {
            tracing::info!("controller reachable again, leaving fallback");
        }
        state.in_fallback = false;
        state.failure_count = 0;
    }

    fn record_failure(&self) {
        self.state.lock().unwrap().failure_count += 1;
    }

    // ── Retry machinery ─────────────────────────────────────────

    /// Run `attempt_fn` up to `max_retries` times. The first attempt has
    /// no pre-delay; attempt `k+1` waits for the `k`-th backoff entry,
    /// clamped to the last. A fully-retried failure counts once toward
    /// the fallback latch.
    async fn with_retries<T, F, Fut>(
        &self,
        what: &'static str,
        mut attempt_fn: F,
    ) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut last_err = None;
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff_delay(attempt - 1)).await;
            }
            match attempt_fn().await {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(what, attempt, error = %e, "controller request failed");
                    last_err = Some(e);
                }
            }
        }
        self.record_failure();
        Err(last_err.expect("max_retries >= 1 checked at construction"))
    }

    fn backoff_delay(&self, k: u32) -> Duration {
        let idx = (k as usize).min(self.backoff.len() - 1);
        self.backoff[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    fn test_client(base_url: &str) -> ControllerClient {
        ControllerClient::new(
            base_url,
            Duration::from_secs(1),
            3,
            vec![Duration::ZERO],
        )
        .unwrap()
    }

    /// Controller stand-in whose answers flip with one switch.
    async fn spawn_flaky_controller() -> (String, Arc<AtomicBool>) {
        let healthy = Arc::new(AtomicBool::new(false));

        async fn telemetry(State(healthy): State<Arc<AtomicBool>>) -> StatusCode {
            if healthy.load(Ordering::Relaxed) {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
        async fn routes(
            State(healthy): State<Arc<AtomicBool>>,
        ) -> Result<Json<serde_json::Value>, StatusCode> {
            if healthy.load(Ordering::Relaxed) {
                Ok(Json(serde_json::json!({ "routes": [] })))
            } else {
                Err(StatusCode::NOT_FOUND)
            }
        }

        let app = Router::new()
            .route("/api/v1/telemetry", post(telemetry))
            .route("/api/v1/routes", get(routes))
            .route("/health", get(|| async { StatusCode::OK }))
            .with_state(healthy.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), healthy)
    }

    fn report() -> TelemetryReport {
        TelemetryReport {
            agent_id: "10.254.0.1".into(),
            timestamp: 1_700_000_000,
            metrics: vec![trellis_common::telemetry::MetricSample {
                target_ip: "10.254.0.2".into(),
                rtt_ms: Some(10.0),
                loss_rate: 0.0,
            }],
        }
    }

    #[test]
    fn backoff_clamps_to_last_entry() {
        let client = ControllerClient::new(
            "http://127.0.0.1:1",
            Duration::from_secs(1),
            5,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
        )
        .unwrap();
        assert_eq!(client.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(client.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(client.backoff_delay(9), Duration::from_secs(4));
    }

    #[test]
    fn rejects_empty_backoff() {
        assert!(ControllerClient::new(
            "http://127.0.0.1:1",
            Duration::from_secs(1),
            3,
            vec![]
        )
        .is_err());
    }

    #[tokio::test]
    async fn three_failed_operations_arm_the_latch() {
        let (url, _healthy) = spawn_flaky_controller().await;
        let client = test_client(&url);

        for _ in 0..2 {
            assert!(client.send_telemetry(&report()).await.is_err());
            assert!(!client.should_enter_fallback());
        }
        assert!(client.send_telemetry(&report()).await.is_err());
        assert!(client.should_enter_fallback());
        assert_eq!(client.failure_count(), 3);

        client.enter_fallback();
        assert!(client.is_in_fallback());
        // Armed only for the transition, not repeatedly.
        assert!(!client.should_enter_fallback());
    }

    #[tokio::test]
    async fn one_success_exits_fallback_and_zeroes_failures() {
        let (url, healthy) = spawn_flaky_controller().await;
        let client = test_client(&url);

        for _ in 0..3 {
            let _ = client.send_telemetry(&report()).await;
        }
        client.enter_fallback();
        assert!(client.is_in_fallback());

        healthy.store(true, Ordering::Relaxed);
        client.send_telemetry(&report()).await.unwrap();
        assert!(!client.is_in_fallback());
        assert_eq!(client.failure_count(), 0);
    }

    #[tokio::test]
    async fn health_probe_success_exits_fallback() {
        let (url, _healthy) = spawn_flaky_controller().await;
        let client = test_client(&url);

        for _ in 0..3 {
            let _ = client.get_routes("10.254.0.1").await;
        }
        client.enter_fallback();

        client.check_health().await.unwrap();
        assert!(!client.is_in_fallback());
        assert_eq!(client.failure_count(), 0);
    }

    #[tokio::test]
    async fn final_404_is_distinguished() {
        let (url, _healthy) = spawn_flaky_controller().await;
        let client = test_client(&url);

        match client.get_routes("10.254.0.1").await {
            Err(ClientError::NotFound) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
        // ...but still counted as an operation failure.
        assert_eq!(client.failure_count(), 1);
    }

    #[tokio::test]
    async fn transport_errors_count_toward_the_latch() {
        // Nothing listens on port 1.
        let client = test_client("http://127.0.0.1:1");
        assert!(client.send_telemetry(&report()).await.is_err());
        assert_eq!(client.failure_count(), 1);
    }
}
