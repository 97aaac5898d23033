//! Route directive wire types.
//!
//! The controller answers `GET /api/v1/routes?agent_id=<id>` with a list
//! of [`RouteDirective`]s. A directive is one proposed routing decision:
//! either "relay traffic for this destination through that peer" or
//! "withdraw any override and let the tunnel default apply" (`direct`).

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::net::{self, SubnetError};

/// Where traffic for a destination should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NextHop {
    /// Withdraw any override; the tunnel's own path applies.
    Direct,
    /// Relay through this peer's tunnel IP.
    Via(Ipv4Addr),
}

impl TryFrom<String> for NextHop {
    type Error = SubnetError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s == "direct" {
            return Ok(NextHop::Direct);
        }
        s.parse()
            .map(NextHop::Via)
            .map_err(|_| SubnetError::BadAddress(s))
    }
}

impl From<NextHop> for String {
    fn from(h: NextHop) -> Self {
        h.to_string()
    }
}

impl std::fmt::Display for NextHop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NextHop::Direct => write!(f, "direct"),
            NextHop::Via(ip) => write!(f, "{ip}"),
        }
    }
}

/// Why a directive was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    /// A relay path beats the direct tunnel.
    OptimizedPath,
    /// The direct tunnel path is best; any override is withdrawn.
    Default,
}

/// One routing decision for one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDirective {
    /// Host destination, always `<ipv4>/32` on the wire.
    pub dst_cidr: String,
    pub next_hop: NextHop,
    pub reason: RouteReason,
}

impl RouteDirective {
    /// The destination as a bare address, if `dst_cidr` is well-formed.
    pub fn dst_addr(&self) -> Result<Ipv4Addr, SubnetError> {
        net::parse_host_cidr(&self.dst_cidr)
    }
}
