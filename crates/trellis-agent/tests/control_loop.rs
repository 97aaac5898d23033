//! End-to-end control loop tests.
//!
//! These spin up the real controller router on an ephemeral TCP port and
//! drive the agent's actual client, executor, and supervisor against it —
//! only the ICMP probes and the kernel route table are replaced by
//! test doubles.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use trellis_agent::client::ControllerClient;
use trellis_agent::executor::RouteExecutor;
use trellis_agent::ping::Pinger;
use trellis_agent::prober::Prober;
use trellis_agent::routeops::MemRouteOps;
use trellis_agent::supervisor::Supervisor;

use trellis_common::net::TunnelSubnet;
use trellis_common::telemetry::{MetricSample, TelemetryReport};

use trellis_controller::config::ControllerConfig;
use trellis_controller::state::AppState;

const A: &str = "10.254.0.1";
const B: &str = "10.254.0.2";
const C: &str = "10.254.0.3";

async fn spawn_controller() -> (String, AppState) {
    let state = AppState::new(ControllerConfig::default());
    let app = trellis_controller::api::router().with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

fn fast_client(base_url: &str) -> Arc<ControllerClient> {
    Arc::new(
        ControllerClient::new(
            base_url,
            Duration::from_secs(1),
            3,
            vec![Duration::ZERO],
        )
        .unwrap(),
    )
}

fn report(agent_id: &str, targets: &[(&str, f64)]) -> TelemetryReport {
    TelemetryReport {
        agent_id: agent_id.into(),
        timestamp: chrono::Utc::now().timestamp(),
        metrics: targets
            .iter()
            .map(|(t, rtt)| MetricSample {
                target_ip: (*t).into(),
                rtt_ms: Some(*rtt),
                loss_rate: 0.0,
            })
            .collect(),
    }
}

/// Pinger with one fixed RTT per target.
struct ScriptedPinger {
    rtts: HashMap<Ipv4Addr, f64>,
}

impl Pinger for ScriptedPinger {
    async fn ping(&self, target: Ipv4Addr, _timeout: Duration) -> Option<f64> {
        self.rtts.get(&target).copied()
    }
}

#[tokio::test]
async fn degraded_peer_gets_relayed_through_healthy_one() {
    let (url, _state) = spawn_controller().await;
    let client = fast_client(&url);

    // B and C report a healthy B↔C link; A's own path to C is poor.
    client.send_telemetry(&report(B, &[(A, 10.0), (C, 10.0)])).await.unwrap();
    client.send_telemetry(&report(C, &[(A, 100.0), (B, 10.0)])).await.unwrap();

    let pinger = ScriptedPinger {
        rtts: HashMap::from([
            (B.parse().unwrap(), 10.0),
            (C.parse().unwrap(), 100.0),
        ]),
    };
    let prober = Arc::new(Prober::new(
        pinger,
        vec![B.parse().unwrap(), C.parse().unwrap()],
        Duration::from_millis(20),
        Duration::from_millis(10),
        10,
    ));
    let ops = MemRouteOps::default();
    let executor = Arc::new(RouteExecutor::new(
        ops.clone(),
        TunnelSubnet::default_overlay(),
        A.parse().unwrap(),
    ));
    let supervisor = Supervisor::new(
        A.into(),
        prober,
        client.clone(),
        executor.clone(),
        Duration::from_millis(50),
    );
    supervisor.start().await;

    // The loop pushes A's telemetry, pulls directives, and installs the
    // relay: traffic for C goes through B.
    let c: Ipv4Addr = C.parse().unwrap();
    let b: Ipv4Addr = B.parse().unwrap();
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if executor.managed_snapshot().await.get(&c) == Some(&b) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for relay route C via B");
    assert!(!client.is_in_fallback());

    // Graceful shutdown restores the pre-agent route table.
    supervisor.shutdown(Duration::from_secs(5)).await;
    assert!(ops.routes().is_empty());
    assert_eq!(executor.managed_count().await, 0);
}

#[tokio::test]
async fn fallback_flushes_and_recovery_resumes() {
    let (url, _state) = spawn_controller().await;
    let client = fast_client(&url);

    let ops = MemRouteOps::default();
    let executor = RouteExecutor::new(
        ops.clone(),
        TunnelSubnet::default_overlay(),
        A.parse().unwrap(),
    );

    // A previously installed override.
    executor
        .sync_routes(&[trellis_common::routes::RouteDirective {
            dst_cidr: format!("{C}/32"),
            next_hop: trellis_common::routes::NextHop::Via(B.parse().unwrap()),
            reason: trellis_common::routes::RouteReason::OptimizedPath,
        }])
        .await;
    assert_eq!(executor.managed_count().await, 1);

    // The controller answers, but knows nothing about us: every route
    // fetch is a fully-retried failure.
    for _ in 0..2 {
        assert!(client.get_routes(A).await.is_err());
        assert!(!client.should_enter_fallback());
    }
    assert!(client.get_routes(A).await.is_err());
    assert!(client.should_enter_fallback());

    client.enter_fallback();
    executor.flush_routes().await;
    assert!(client.is_in_fallback());
    assert_eq!(executor.managed_count().await, 0);
    assert!(ops.routes().is_empty());

    // One successful operation ends the outage.
    client.send_telemetry(&report(A, &[(B, 10.0)])).await.unwrap();
    assert!(!client.is_in_fallback());
    assert_eq!(client.failure_count(), 0);

    // And the routes endpoint knows us again (nothing to publish yet:
    // no other agent has reported).
    let routes = client.get_routes(A).await.unwrap();
    assert!(routes.is_empty());
}

#[tokio::test]
async fn health_probe_recovers_fallback_without_telemetry() {
    let (url, _state) = spawn_controller().await;
    let client = fast_client(&url);

    for _ in 0..3 {
        let _ = client.get_routes(A).await;
    }
    client.enter_fallback();
    assert!(client.is_in_fallback());

    client.check_health().await.unwrap();
    client.reset_failure_count();
    assert!(!client.is_in_fallback());
    assert_eq!(client.failure_count(), 0);
}
