//! Kernel route primitives.
//!
//! The executor needs three operations on the tunnel interface: replace
//! a host route, delete a host route, and enumerate what is there.
//! Production shells out to `ip route`; `--simulate` and tests use an
//! in-memory table. Only validated `Ipv4Addr` values are ever formatted
//! into the command line.

use std::collections::HashMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route command failed: {0}")]
    Command(String),
    #[error("could not run route command: {0}")]
    Io(#[from] std::io::Error),
}

/// One installed host route on the tunnel interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelRoute {
    pub dst: Ipv4Addr,
    /// `None` for an on-link route without an explicit next hop.
    pub via: Option<Ipv4Addr>,
}

pub trait RouteOps: Send + Sync + 'static {
    /// Current host routes on the tunnel interface.
    fn list(&self) -> impl Future<Output = Result<Vec<KernelRoute>, RouteError>> + Send;

    /// Install or update `dst/32` via `via`. Idempotent.
    fn replace(
        &self,
        dst: Ipv4Addr,
        via: Ipv4Addr,
    ) -> impl Future<Output = Result<(), RouteError>> + Send;

    /// Remove the host route for `dst/32`. An absent route is success.
    fn delete(&self, dst: Ipv4Addr) -> impl Future<Output = Result<(), RouteError>> + Send;
}

// ── ip route ────────────────────────────────────────────────────────

/// Linux `ip route` backend.
pub struct IpRouteOps {
    interface: String,
}

impl IpRouteOps {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, RouteError> {
        let output = tokio::process::Command::new("ip")
            .args(args)
            .output()
            .await?;
        if !output.status.success() {
            return Err(RouteError::Command(format!(
                "ip {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl RouteOps for IpRouteOps {
    async fn list(&self) -> Result<Vec<KernelRoute>, RouteError> {
        let out = self
            .run(&["-4", "route", "show", "dev", &self.interface])
            .await?;
        Ok(parse_route_table(&out))
    }

    async fn replace(&self, dst: Ipv4Addr, via: Ipv4Addr) -> Result<(), RouteError> {
        let dst = format!("{dst}/32");
        let via = via.to_string();
        self.run(&["route", "replace", &dst, "via", &via, "dev", &self.interface])
            .await
            .map(|_| ())
    }

    async fn delete(&self, dst: Ipv4Addr) -> Result<(), RouteError> {
        let dst = format!("{dst}/32");
        match self
            .run(&["route", "del", &dst, "dev", &self.interface])
            .await
        {
            Ok(_) => Ok(()),
            // "No such process" is the kernel's way of saying the route
            // was already gone.
            Err(RouteError::Command(msg)) if msg.contains("No such process") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Parse `ip -4 route show dev <ifc>` output. Host routes print a bare
/// address; anything with a prefix (the tunnel's own subnet route) is
/// skipped.
fn parse_route_table(out: &str) -> Vec<KernelRoute> {
    out.lines().filter_map(parse_route_line).collect()
}

fn parse_route_line(line: &str) -> Option<KernelRoute> {
    let mut tokens = line.split_whitespace();
    let dst: Ipv4Addr = tokens.next()?.parse().ok()?;
    let mut via = None;
    while let Some(token) = tokens.next() {
        if token == "via" {
            via = tokens.next().and_then(|v| v.parse().ok());
            break;
        }
    }
    Some(KernelRoute { dst, via })
}

// ── In-memory table ─────────────────────────────────────────────────

/// Route table backed by a map, for `--simulate` and tests. Clones
/// share the table.
#[derive(Clone, Default)]
pub struct MemRouteOps {
    table: Arc<Mutex<HashMap<Ipv4Addr, Option<Ipv4Addr>>>>,
}

impl MemRouteOps {
    pub fn routes(&self) -> Vec<KernelRoute> {
        let mut routes: Vec<KernelRoute> = self
            .table
            .lock()
            .unwrap()
            .iter()
            .map(|(dst, via)| KernelRoute {
                dst: *dst,
                via: *via,
            })
            .collect();
        routes.sort();
        routes
    }
}

impl RouteOps for MemRouteOps {
    async fn list(&self) -> Result<Vec<KernelRoute>, RouteError> {
        Ok(self.routes())
    }

    async fn replace(&self, dst: Ipv4Addr, via: Ipv4Addr) -> Result<(), RouteError> {
        self.table.lock().unwrap().insert(dst, Some(via));
        Ok(())
    }

    async fn delete(&self, dst: Ipv4Addr) -> Result<(), RouteError> {
        self.table.lock().unwrap().remove(&dst);
        Ok(())
    }
}
