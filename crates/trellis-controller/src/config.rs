//! Controller configuration.
//!
//! The controller is configured entirely through environment variables
//! with sensible defaults, so a bare `trellis-controller` starts a
//! working instance on `0.0.0.0:8400`.

use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Address the HTTP surface binds to.
    pub listen_addr: SocketAddr,
    /// Cost penalty per unit of loss: 1% loss weighs like
    /// `penalty_factor / 100` ms of extra latency.
    pub penalty_factor: f64,
    /// Minimum relative cost improvement before a directive is
    /// republished, e.g. 0.15 = 15%.
    pub hysteresis: f64,
    /// Agent records older than this are evicted.
    pub stale_threshold: Duration,
    /// How often the cleaner scans for stale records.
    pub cleaner_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8400".parse().expect("static addr"),
            penalty_factor: 100.0,
            hysteresis: 0.15,
            stale_threshold: Duration::from_secs(60),
            cleaner_interval: Duration::from_secs(60),
        }
    }
}

impl ControllerConfig {
    /// Read configuration from `TRELLIS_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen_addr = match std::env::var("TRELLIS_LISTEN_ADDR") {
            Ok(s) => s
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid TRELLIS_LISTEN_ADDR {s:?}: {e}"))?,
            Err(_) => defaults.listen_addr,
        };

        let penalty_factor = env_f64("TRELLIS_PENALTY_FACTOR", defaults.penalty_factor)?;
        let hysteresis = env_f64("TRELLIS_HYSTERESIS", defaults.hysteresis)?;
        if !(0.0..1.0).contains(&hysteresis) {
            anyhow::bail!("TRELLIS_HYSTERESIS must be within [0, 1), got {hysteresis}");
        }
        if penalty_factor < 0.0 {
            anyhow::bail!("TRELLIS_PENALTY_FACTOR must be non-negative, got {penalty_factor}");
        }

        let stale_threshold = Duration::from_secs(env_u64(
            "TRELLIS_STALE_THRESHOLD_SECS",
            defaults.stale_threshold.as_secs(),
        )?);
        let cleaner_interval = Duration::from_secs(env_u64(
            "TRELLIS_CLEANER_INTERVAL_SECS",
            defaults.cleaner_interval.as_secs(),
        )?);

        Ok(Self {
            listen_addr,
            penalty_factor,
            hysteresis,
            stale_threshold,
            cleaner_interval,
        })
    }
}

fn env_f64(name: &str, default: f64) -> anyhow::Result<f64> {
    match std::env::var(name) {
        Ok(s) => s
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {name} {s:?}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_u64(name: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(name) {
        Ok(s) => s
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {name} {s:?}: {e}")),
        Err(_) => Ok(default),
    }
}
