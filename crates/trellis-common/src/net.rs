//! Tunnel subnet parsing and membership checks.
//!
//! Every address the router acts on — telemetry targets, route
//! destinations, next hops — must lie inside the operator-configured
//! tunnel subnet. This module is the single place that decides what
//! "inside" means.

use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubnetError {
    #[error("malformed subnet {0:?}, expected <ipv4>/<prefix>")]
    Malformed(String),
    #[error("invalid IPv4 address {0:?}")]
    BadAddress(String),
    #[error("prefix length {0} out of range (0-32)")]
    BadPrefix(u8),
}

/// An IPv4 subnet, e.g. `10.254.0.0/24`.
///
/// The network address is normalized on construction (host bits masked
/// off), so `10.254.0.5/24` and `10.254.0.0/24` are the same subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TunnelSubnet {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl TunnelSubnet {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self, SubnetError> {
        if prefix_len > 32 {
            return Err(SubnetError::BadPrefix(prefix_len));
        }
        let mask = Self::mask(prefix_len);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix_len,
        })
    }

    /// The default overlay subnet, `10.254.0.0/24`.
    pub fn default_overlay() -> Self {
        Self {
            network: Ipv4Addr::new(10, 254, 0, 0),
            prefix_len: 24,
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = Self::mask(self.prefix_len);
        u32::from(addr) & mask == u32::from(self.network)
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    fn mask(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix_len))
        }
    }
}

impl FromStr for TunnelSubnet {
    type Err = SubnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| SubnetError::Malformed(s.to_string()))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| SubnetError::BadAddress(addr.to_string()))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| SubnetError::Malformed(s.to_string()))?;
        Self::new(addr, prefix_len)
    }
}

impl std::fmt::Display for TunnelSubnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl TryFrom<String> for TunnelSubnet {
    type Error = SubnetError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TunnelSubnet> for String {
    fn from(s: TunnelSubnet) -> Self {
        s.to_string()
    }
}

/// Parse a host destination like `10.254.0.5/32` or a bare `10.254.0.5`.
///
/// Rejects any prefix other than /32 — host routes are the only thing
/// the executor is allowed to touch.
pub fn parse_host_cidr(s: &str) -> Result<Ipv4Addr, SubnetError> {
    let addr = match s.split_once('/') {
        Some((addr, "32")) => addr,
        Some(_) => return Err(SubnetError::Malformed(s.to_string())),
        None => s,
    };
    addr.parse()
        .map_err(|_| SubnetError::BadAddress(addr.to_string()))
}
