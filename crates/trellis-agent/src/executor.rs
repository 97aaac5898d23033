//! Route executor.
//!
//! Applies the controller's directives to the kernel and remembers
//! exactly which host routes it installed, so they can all be withdrawn
//! on fallback or shutdown. Hard rule: nothing outside the tunnel
//! subnet is ever touched, whatever the controller says.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use trellis_common::net::TunnelSubnet;
use trellis_common::routes::{NextHop, RouteDirective};

use crate::routeops::{RouteError, RouteOps};

/// Minimal change set between an installed state and a desired state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDiff {
    /// Destinations to install or repoint, with their next hop.
    pub to_add: Vec<(Ipv4Addr, Ipv4Addr)>,
    /// Destinations present but no longer desired.
    pub to_remove: Vec<Ipv4Addr>,
}

/// Diff two route maps (`dst → via`). Applying `to_add` and `to_remove`
/// to `current` yields exactly `desired`.
pub fn calculate_diff(
    current: &HashMap<Ipv4Addr, Ipv4Addr>,
    desired: &HashMap<Ipv4Addr, Ipv4Addr>,
) -> RouteDiff {
    let mut to_add: Vec<(Ipv4Addr, Ipv4Addr)> = desired
        .iter()
        .filter(|(dst, via)| current.get(*dst) != Some(*via))
        .map(|(dst, via)| (*dst, *via))
        .collect();
    to_add.sort();

    let mut to_remove: Vec<Ipv4Addr> = current
        .keys()
        .filter(|dst| !desired.contains_key(*dst))
        .copied()
        .collect();
    to_remove.sort();

    RouteDiff { to_add, to_remove }
}

pub struct RouteExecutor<R: RouteOps> {
    ops: R,
    subnet: TunnelSubnet,
    own_ip: Ipv4Addr,
    /// dst → via for every override this executor installed.
    managed: tokio::sync::Mutex<HashMap<Ipv4Addr, Ipv4Addr>>,
}

impl<R: RouteOps> RouteExecutor<R> {
    pub fn new(ops: R, subnet: TunnelSubnet, own_ip: Ipv4Addr) -> Self {
        Self {
            ops,
            subnet,
            own_ip,
            managed: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Apply a batch of directives, best-effort. A directive that fails
    /// validation or whose kernel command errors is logged and skipped;
    /// the batch always runs to completion.
    ///
    /// Destinations merely absent from the batch are left alone — the
    /// controller omits a directive to mean "no change". Withdrawal is
    /// always explicit, as a `direct` next hop.
    pub async fn sync_routes(&self, directives: &[RouteDirective]) {
        let mut managed = self.managed.lock().await;

        let mut desired: HashMap<Ipv4Addr, Ipv4Addr> = HashMap::new();
        let mut withdrawals: Vec<Ipv4Addr> = Vec::new();
        let mut rejected = 0usize;

        for directive in directives {
            let Some(dst) = self.validated_dst(directive) else {
                rejected += 1;
                continue;
            };
            match directive.next_hop {
                NextHop::Direct => withdrawals.push(dst),
                NextHop::Via(hop) => {
                    if !self.subnet.contains(hop) || hop == self.own_ip || hop == dst {
                        tracing::warn!(
                            dst = %dst,
                            next_hop = %hop,
                            "rejecting directive with invalid next hop"
                        );
                        rejected += 1;
                        continue;
                    }
                    desired.insert(dst, hop);
                }
            }
        }

        // Only overrides that are new or repointed need a kernel call;
        // replace is idempotent but there is no reason to spam it.
        let RouteDiff { to_add, .. } = calculate_diff(&managed, &desired);

        let mut applied = 0usize;
        let mut failed = 0usize;

        for (dst, via) in to_add {
            match self.ops.replace(dst, via).await {
                Ok(()) => {
                    managed.insert(dst, via);
                    applied += 1;
                    tracing::debug!(dst = %dst, via = %via, "installed relay route");
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!(dst = %dst, via = %via, error = %e, "route replace failed");
                }
            }
        }

        for dst in withdrawals {
            match self.ops.delete(dst).await {
                Ok(()) => {
                    if managed.remove(&dst).is_some() {
                        applied += 1;
                    }
                    tracing::debug!(dst = %dst, "withdrew override, direct path applies");
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!(dst = %dst, error = %e, "route delete failed");
                }
            }
        }

        if applied + failed + rejected > 0 {
            tracing::debug!(applied, failed, rejected, managed = managed.len(), "route sync done");
        }
    }

    /// Withdraw every route on the tunnel interface whose next hop lies
    /// inside the tunnel subnet. Used when entering fallback: the
    /// tunnel's own direct paths take over wholesale.
    pub async fn flush_routes(&self) {
        let mut managed = self.managed.lock().await;

        match self.ops.list().await {
            Ok(routes) => {
                for route in routes {
                    if !self.subnet.contains(route.dst) {
                        continue;
                    }
                    let Some(via) = route.via else { continue };
                    if !self.subnet.contains(via) {
                        continue;
                    }
                    if let Err(e) = self.ops.delete(route.dst).await {
                        tracing::warn!(dst = %route.dst, error = %e, "flush delete failed");
                    }
                }
            }
            Err(e) => {
                // Can't enumerate: fall back to withdrawing what we know
                // we installed.
                tracing::warn!(error = %e, "could not enumerate routes, deleting managed set");
                for dst in managed.keys().copied().collect::<Vec<_>>() {
                    if let Err(e) = self.ops.delete(dst).await {
                        tracing::warn!(dst = %dst, error = %e, "flush delete failed");
                    }
                }
            }
        }

        managed.clear();
        tracing::info!("flushed overlay host routes");
    }

    /// Withdraw exactly the set this executor installed. Idempotent.
    /// Entries whose delete fails stay managed so a retry can get them.
    pub async fn cleanup_managed_routes(&self) -> (usize, Vec<RouteError>) {
        let mut managed = self.managed.lock().await;
        let mut cleaned = 0usize;
        let mut errors = Vec::new();

        for dst in managed.keys().copied().collect::<Vec<_>>() {
            match self.ops.delete(dst).await {
                Ok(()) => {
                    managed.remove(&dst);
                    cleaned += 1;
                }
                Err(e) => {
                    tracing::warn!(dst = %dst, error = %e, "cleanup delete failed");
                    errors.push(e);
                }
            }
        }

        tracing::info!(cleaned, errors = errors.len(), "managed routes cleaned up");
        (cleaned, errors)
    }

    pub async fn managed_count(&self) -> usize {
        self.managed.lock().await.len()
    }

    /// Snapshot of the managed set (dst → via).
    pub async fn managed_snapshot(&self) -> HashMap<Ipv4Addr, Ipv4Addr> {
        self.managed.lock().await.clone()
    }

    fn validated_dst(&self, directive: &RouteDirective) -> Option<Ipv4Addr> {
        let dst = match directive.dst_addr() {
            Ok(dst) => dst,
            Err(e) => {
                tracing::warn!(dst_cidr = %directive.dst_cidr, error = %e, "rejecting malformed destination");
                return None;
            }
        };
        if !self.subnet.contains(dst) || dst == self.own_ip {
            tracing::warn!(dst = %dst, "rejecting destination outside tunnel subnet");
            return None;
        }
        Some(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use trellis_common::routes::RouteReason;

    use crate::routeops::{KernelRoute, MemRouteOps};

    const OWN: Ipv4Addr = Ipv4Addr::new(10, 254, 0, 1);

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 254, 0, last)
    }

    fn via(dst: Ipv4Addr, hop: Ipv4Addr) -> RouteDirective {
        RouteDirective {
            dst_cidr: format!("{dst}/32"),
            next_hop: NextHop::Via(hop),
            reason: RouteReason::OptimizedPath,
        }
    }

    fn direct(dst: Ipv4Addr) -> RouteDirective {
        RouteDirective {
            dst_cidr: format!("{dst}/32"),
            next_hop: NextHop::Direct,
            reason: RouteReason::Default,
        }
    }

    fn executor(ops: MemRouteOps) -> RouteExecutor<MemRouteOps> {
        RouteExecutor::new(ops, TunnelSubnet::default_overlay(), OWN)
    }

    #[tokio::test]
    async fn sync_installs_and_tracks_relay_routes() {
        let ops = MemRouteOps::default();
        let exec = executor(ops.clone());

        exec.sync_routes(&[via(ip(3), ip(2)), direct(ip(2))]).await;

        assert_eq!(
            ops.routes(),
            vec![KernelRoute {
                dst: ip(3),
                via: Some(ip(2))
            }]
        );
        assert_eq!(exec.managed_snapshot().await, HashMap::from([(ip(3), ip(2))]));
    }

    #[tokio::test]
    async fn direct_withdraws_a_previous_override() {
        let ops = MemRouteOps::default();
        let exec = executor(ops.clone());

        exec.sync_routes(&[via(ip(3), ip(2))]).await;
        exec.sync_routes(&[direct(ip(3))]).await;

        assert!(ops.routes().is_empty());
        assert_eq!(exec.managed_count().await, 0);
    }

    #[tokio::test]
    async fn omitted_destination_is_left_alone() {
        let ops = MemRouteOps::default();
        let exec = executor(ops.clone());

        exec.sync_routes(&[via(ip(3), ip(2))]).await;
        // Next batch says nothing about .3: the override must survive.
        exec.sync_routes(&[via(ip(4), ip(2))]).await;

        assert_eq!(exec.managed_count().await, 2);
        assert_eq!(ops.routes().len(), 2);
    }

    /// Records every kernel call; optionally fails deletes.
    #[derive(Clone, Default)]
    struct RecordingOps {
        calls: Arc<Mutex<Vec<String>>>,
        fail_deletes: bool,
    }

    impl RouteOps for RecordingOps {
        async fn list(&self) -> Result<Vec<KernelRoute>, RouteError> {
            self.calls.lock().unwrap().push("list".into());
            Ok(vec![])
        }
        async fn replace(&self, dst: Ipv4Addr, via: Ipv4Addr) -> Result<(), RouteError> {
            self.calls.lock().unwrap().push(format!("replace {dst} via {via}"));
            Ok(())
        }
        async fn delete(&self, dst: Ipv4Addr) -> Result<(), RouteError> {
            self.calls.lock().unwrap().push(format!("delete {dst}"));
            if self.fail_deletes {
                Err(RouteError::Command("permission denied".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn out_of_subnet_directives_never_reach_the_kernel() {
        let ops = RecordingOps::default();
        let exec = RouteExecutor::new(ops.clone(), TunnelSubnet::default_overlay(), OWN);

        exec.sync_routes(&[
            via(Ipv4Addr::new(192, 168, 1, 5), ip(2)), // dst outside
            via(ip(3), Ipv4Addr::new(8, 8, 8, 8)),     // hop outside
            via(ip(3), OWN),                           // hop is ourselves
            direct(Ipv4Addr::new(192, 168, 1, 5)),     // withdrawal outside
            RouteDirective {
                dst_cidr: "not-an-ip/32".into(),
                next_hop: NextHop::Direct,
                reason: RouteReason::Default,
            },
        ])
        .await;

        assert!(ops.calls.lock().unwrap().is_empty());
        assert_eq!(exec.managed_count().await, 0);
    }

    #[tokio::test]
    async fn unchanged_overrides_are_not_reapplied() {
        let ops = RecordingOps::default();
        let exec = RouteExecutor::new(ops.clone(), TunnelSubnet::default_overlay(), OWN);

        exec.sync_routes(&[via(ip(3), ip(2))]).await;
        exec.sync_routes(&[via(ip(3), ip(2))]).await;
        exec.sync_routes(&[via(ip(3), ip(4))]).await; // repointed

        let calls = ops.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "replace 10.254.0.3 via 10.254.0.2".to_string(),
                "replace 10.254.0.3 via 10.254.0.4".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn failed_delete_keeps_entry_managed() {
        let ops = RecordingOps {
            fail_deletes: true,
            ..Default::default()
        };
        let exec = RouteExecutor::new(ops.clone(), TunnelSubnet::default_overlay(), OWN);

        exec.sync_routes(&[via(ip(3), ip(2)), via(ip(4), ip(2))]).await;
        let (cleaned, errors) = exec.cleanup_managed_routes().await;

        assert_eq!(cleaned, 0);
        assert_eq!(errors.len(), 2);
        assert_eq!(exec.managed_count().await, 2);
    }

    #[tokio::test]
    async fn cleanup_empties_the_managed_set() {
        let ops = MemRouteOps::default();
        let exec = executor(ops.clone());

        exec.sync_routes(&[via(ip(3), ip(2)), via(ip(4), ip(5))]).await;
        let (cleaned, errors) = exec.cleanup_managed_routes().await;

        assert_eq!(cleaned, 2);
        assert!(errors.is_empty());
        assert_eq!(exec.managed_count().await, 0);
        assert!(ops.routes().is_empty());

        // Idempotent.
        let (cleaned, errors) = exec.cleanup_managed_routes().await;
        assert_eq!(cleaned, 0);
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn flush_removes_only_tunnel_relay_routes() {
        let ops = MemRouteOps::default();
        // A relay route we installed plus one some other tool installed.
        ops.replace(ip(3), ip(2)).await.unwrap();
        ops.replace(Ipv4Addr::new(10, 9, 9, 9), Ipv4Addr::new(10, 9, 9, 1))
            .await
            .unwrap();

        let exec = executor(ops.clone());
        exec.sync_routes(&[via(ip(4), ip(2))]).await;
        exec.flush_routes().await;

        // Only the out-of-subnet route survives.
        assert_eq!(
            ops.routes(),
            vec![KernelRoute {
                dst: Ipv4Addr::new(10, 9, 9, 9),
                via: Some(Ipv4Addr::new(10, 9, 9, 1))
            }]
        );
        assert_eq!(exec.managed_count().await, 0);
    }

    #[test]
    fn diff_law_holds() {
        let current = HashMap::from([(ip(3), ip(2)), (ip(4), ip(2)), (ip(5), ip(6))]);
        let desired = HashMap::from([(ip(3), ip(2)), (ip(4), ip(7)), (ip(8), ip(2))]);

        let diff = calculate_diff(&current, &desired);
        assert_eq!(diff.to_add, vec![(ip(4), ip(7)), (ip(8), ip(2))]);
        assert_eq!(diff.to_remove, vec![ip(5)]);

        // Applying the diff to `current` yields `desired`.
        let mut applied = current.clone();
        for dst in &diff.to_remove {
            applied.remove(dst);
        }
        for (dst, hop) in &diff.to_add {
            applied.insert(*dst, *hop);
        }
        assert_eq!(applied, desired);
    }

    #[test]
    fn diff_of_identical_states_is_empty() {
        let state = HashMap::from([(ip(3), ip(2))]);
        let diff = calculate_diff(&state, &state);
        assert!(diff.to_add.is_empty());
        assert!(diff.to_remove.is_empty());
    }
}
