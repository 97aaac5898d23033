//! Prometheus metrics rendering for peer metrics.
//!
//! Renders smoothed [`MetricSample`]s in Prometheus text exposition
//! format, suitable for scraping by Prometheus or compatible collectors.

use std::fmt::Write;

use crate::telemetry::MetricSample;

/// Render a slice of smoothed peer metrics as Prometheus text exposition
/// format.
pub fn render_prometheus(metrics: &[MetricSample]) -> String {
    let mut out = String::with_capacity(2048);

    // ── Per-peer gauges ─────────────────────────────────────────

    writeln!(
        out,
        "# HELP trellis_peer_rtt_ms Smoothed RTT to the peer in milliseconds."
    )
    .unwrap();
    writeln!(out, "# TYPE trellis_peer_rtt_ms gauge").unwrap();
    for m in metrics {
        if let Some(rtt) = m.rtt_ms {
            writeln!(
                out,
                "trellis_peer_rtt_ms{{peer=\"{}\"}} {rtt:.3}",
                m.target_ip
            )
            .unwrap();
        }
    }

    writeln!(
        out,
        "# HELP trellis_peer_loss_rate Smoothed packet loss rate toward the peer (0.0-1.0)."
    )
    .unwrap();
    writeln!(out, "# TYPE trellis_peer_loss_rate gauge").unwrap();
    for m in metrics {
        writeln!(
            out,
            "trellis_peer_loss_rate{{peer=\"{}\"}} {:.6}",
            m.target_ip, m.loss_rate
        )
        .unwrap();
    }

    writeln!(
        out,
        "# HELP trellis_peer_reachable Whether any probe in the window got a reply (1=yes, 0=no)."
    )
    .unwrap();
    writeln!(out, "# TYPE trellis_peer_reachable gauge").unwrap();
    for m in metrics {
        let v = if m.rtt_ms.is_some() { 1 } else { 0 };
        writeln!(
            out,
            "trellis_peer_reachable{{peer=\"{}\"}} {v}",
            m.target_ip
        )
        .unwrap();
    }

    // ── Aggregate metrics ───────────────────────────────────────

    let reachable = metrics.iter().filter(|m| m.rtt_ms.is_some()).count();

    writeln!(
        out,
        "# HELP trellis_peers_total Total number of probed peers."
    )
    .unwrap();
    writeln!(out, "# TYPE trellis_peers_total gauge").unwrap();
    writeln!(out, "trellis_peers_total {}", metrics.len()).unwrap();

    writeln!(
        out,
        "# HELP trellis_peers_reachable Number of peers currently reachable."
    )
    .unwrap();
    writeln!(out, "# TYPE trellis_peers_reachable gauge").unwrap();
    writeln!(out, "trellis_peers_reachable {reachable}").unwrap();

    out
}
