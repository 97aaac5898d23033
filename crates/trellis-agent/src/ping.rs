//! ICMP echo primitive.
//!
//! The prober only needs one operation from the host: send one echo,
//! report the RTT or the absence of a reply. Production uses the system
//! `ping` binary (which carries the needed capabilities everywhere);
//! `--simulate` swaps in a synthetic pinger so a whole overlay can run
//! on one laptop without privileges.

use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

/// One ICMP echo toward a peer.
pub trait Pinger: Send + Sync + 'static {
    /// `Some(rtt_ms)` on a reply, `None` on timeout or any error.
    /// Probe failures are data, not errors.
    fn ping(
        &self,
        target: Ipv4Addr,
        timeout: Duration,
    ) -> impl Future<Output = Option<f64>> + Send;
}

// ── System ping ─────────────────────────────────────────────────────

/// Shells out to `ping -n -c 1 -W <secs>` and parses the reply time.
pub struct SystemPinger;

impl Pinger for SystemPinger {
    async fn ping(&self, target: Ipv4Addr, timeout: Duration) -> Option<f64> {
        let timeout_s = timeout.as_secs().max(1).to_string();
        let output = tokio::process::Command::new("ping")
            .args(["-n", "-c", "1", "-W", &timeout_s])
            .arg(target.to_string())
            .output()
            .await;

        match output {
            Ok(out) if out.status.success() => {
                parse_reply_time(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(_) => None, // no reply within -W, or unreachable
            Err(e) => {
                tracing::debug!(target = %target, error = %e, "could not run ping");
                None
            }
        }
    }
}

/// Extract the RTT from a ping reply line like
/// `64 bytes from 10.254.0.2: icmp_seq=1 ttl=64 time=12.3 ms`.
fn parse_reply_time(output: &str) -> Option<f64> {
    let idx = output.find("time=")?;
    let rest = &output[idx + "time=".len()..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

// ── Simulated ping ──────────────────────────────────────────────────

/// Generates plausible RTTs without touching the network. Each peer gets
/// a stable baseline derived from its address, with jitter and a small
/// chance of a dropped probe.
pub struct SimulatedPinger;

impl Pinger for SimulatedPinger {
    async fn ping(&self, target: Ipv4Addr, _timeout: Duration) -> Option<f64> {
        use rand::RngExt;
        let mut rng = rand::rng();

        if rng.random_range(0.0..1.0_f64) < 0.02 {
            return None;
        }
        let base = 10.0 + f64::from(target.octets()[3] % 40);
        Some(base + rng.random_range(0.0..5.0_f64))
    }
}
