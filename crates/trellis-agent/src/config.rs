//! Agent configuration.
//!
//! Loaded from a TOML file and validated before anything starts. The
//! agent's identity is its tunnel IP: `agent_id` must parse as an IPv4
//! address inside the configured subnet, and so must every peer.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use trellis_common::net::TunnelSubnet;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// This node's tunnel IP, doubling as its identity.
    pub agent_id: String,
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub probe: ProbeSection,
    #[serde(default)]
    pub sync: SyncSection,
    pub network: NetworkSection,
    #[serde(default)]
    pub status: StatusSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerSection {
    #[serde(default = "default_controller_url")]
    pub url: String,
    #[serde(default = "default_controller_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeSection {
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncSection {
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: Vec<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkSection {
    /// Tunnel interface the executor manages host routes on.
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "TunnelSubnet::default_overlay")]
    pub subnet: TunnelSubnet,
    /// Tunnel IPs of every other node in the mesh.
    pub peer_ips: Vec<Ipv4Addr>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusSection {
    #[serde(default = "default_status_addr")]
    pub listen_addr: SocketAddr,
}

fn default_controller_url() -> String {
    "http://10.254.0.1:8400".into()
}
fn default_controller_timeout() -> u64 {
    5
}
fn default_probe_interval() -> u64 {
    5
}
fn default_probe_timeout() -> u64 {
    2
}
fn default_window_size() -> usize {
    10
}
fn default_sync_interval() -> u64 {
    10
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_backoff() -> Vec<u64> {
    vec![1, 2, 4]
}
fn default_interface() -> String {
    "wg0".into()
}
fn default_status_addr() -> SocketAddr {
    "127.0.0.1:9444".parse().expect("static addr")
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            url: default_controller_url(),
            timeout_secs: default_controller_timeout(),
        }
    }
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            interval_secs: default_probe_interval(),
            timeout_secs: default_probe_timeout(),
            window_size: default_window_size(),
        }
    }
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_secs: default_retry_backoff(),
        }
    }
}

impl Default for StatusSection {
    fn default() -> Self {
        Self {
            listen_addr: default_status_addr(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("could not read config file {}", path.display()))?;
        let config: AgentConfig = toml::from_str(&text)
            .with_context(|| format!("could not parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let own = self.own_ip()?;
        anyhow::ensure!(
            self.network.subnet.contains(own),
            "agent_id {own} is outside the tunnel subnet {}",
            self.network.subnet
        );
        anyhow::ensure!(
            !self.network.peer_ips.is_empty(),
            "network.peer_ips must list at least one peer"
        );
        for peer in &self.network.peer_ips {
            anyhow::ensure!(
                self.network.subnet.contains(*peer),
                "peer {peer} is outside the tunnel subnet {}",
                self.network.subnet
            );
            anyhow::ensure!(*peer != own, "peer list must not contain the agent itself");
        }
        anyhow::ensure!(self.probe.interval_secs >= 1, "probe.interval_secs must be at least 1");
        anyhow::ensure!(self.probe.timeout_secs >= 1, "probe.timeout_secs must be at least 1");
        anyhow::ensure!(self.probe.window_size >= 1, "probe.window_size must be at least 1");
        anyhow::ensure!(self.sync.interval_secs >= 1, "sync.interval_secs must be at least 1");
        anyhow::ensure!(self.sync.retry_attempts >= 1, "sync.retry_attempts must be at least 1");
        anyhow::ensure!(
            !self.sync.retry_backoff_secs.is_empty(),
            "sync.retry_backoff_secs must not be empty"
        );
        Ok(())
    }

    pub fn own_ip(&self) -> anyhow::Result<Ipv4Addr> {
        self.agent_id
            .parse()
            .with_context(|| format!("agent_id {:?} is not an IPv4 tunnel address", self.agent_id))
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe.timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }

    pub fn controller_timeout(&self) -> Duration {
        Duration::from_secs(self.controller.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Vec<Duration> {
        self.sync
            .retry_backoff_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }
}
