//! Route solver.
//!
//! Builds a weighted digraph from a topology snapshot, runs single-source
//! Dijkstra for the requesting agent, and turns the shortest-path tree
//! into route directives. A hysteresis gate compares each new path cost
//! against the last published one and suppresses directives that do not
//! improve enough, so marginal measurement noise cannot flap routes.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use trellis_common::routes::{NextHop, RouteDirective, RouteReason};

use crate::store::{AgentRecord, TopologyStore};

/// Edge weight: RTT plus a loss penalty. An unreachable edge (no RTT in
/// the whole window) costs infinity and drops out of the search.
pub fn edge_cost(rtt_ms: Option<f64>, loss_rate: f64, penalty_factor: f64) -> f64 {
    match rtt_ms {
        Some(rtt) => rtt + loss_rate * penalty_factor,
        None => f64::INFINITY,
    }
}

/// True if any node appears twice in the path. Dijkstra on non-negative
/// weights cannot produce one; this exists for tests.
pub fn has_loop(path: &[String]) -> bool {
    let mut seen = std::collections::HashSet::new();
    path.iter().any(|node| !seen.insert(node))
}

pub struct RouteSolver {
    penalty_factor: f64,
    hysteresis: f64,
    /// (source, target) → last published path cost.
    prev_costs: Mutex<HashMap<(String, String), f64>>,
}

impl RouteSolver {
    pub fn new(penalty_factor: f64, hysteresis: f64) -> Self {
        Self {
            penalty_factor,
            hysteresis,
            prev_costs: Mutex::new(HashMap::new()),
        }
    }

    /// Number of (source, target) pairs with a published cost.
    pub fn published_pairs(&self) -> usize {
        self.prev_costs.lock().unwrap().len()
    }

    /// Compute the directives to publish to `source` right now.
    ///
    /// Works on a snapshot of the store; concurrent writes do not affect
    /// a computation in flight. Targets whose best cost has not improved
    /// past the hysteresis gate are omitted entirely — an omitted target
    /// means "no change requested".
    pub fn compute_routes(&self, store: &TopologyStore, source: &str) -> Vec<RouteDirective> {
        let snapshot = store.get_all();
        self.compute_from_snapshot(&snapshot, source)
    }

    fn compute_from_snapshot(
        &self,
        snapshot: &HashMap<String, AgentRecord>,
        source: &str,
    ) -> Vec<RouteDirective> {
        let graph = build_graph(snapshot, self.penalty_factor);
        let (dist, prev) = shortest_paths(&graph, source);

        let mut targets: Vec<&String> = dist.keys().filter(|t| t.as_str() != source).collect();
        targets.sort();

        let mut directives = Vec::new();
        let mut prev_costs = self.prev_costs.lock().unwrap();
        for target in targets {
            let new_cost = dist[target];
            if !new_cost.is_finite() {
                continue;
            }
            let Some(path) = reconstruct_path(&prev, source, target) else {
                continue;
            };
            debug_assert!(!has_loop(&path));

            let key = (source.to_string(), target.clone());
            let publish = match prev_costs.get(&key) {
                None => true,
                Some(&old_cost) => new_cost < old_cost * (1.0 - self.hysteresis),
            };
            if !publish {
                tracing::trace!(
                    source,
                    target = %target,
                    cost = new_cost,
                    "hysteresis gate held back directive"
                );
                continue;
            }

            let Some(directive) = derive_directive(&path, target) else {
                continue;
            };
            prev_costs.insert(key, new_cost);
            tracing::debug!(
                source,
                target = %target,
                next_hop = %directive.next_hop,
                cost = new_cost,
                "publishing directive"
            );
            directives.push(directive);
        }
        directives
    }
}

/// Adjacency keyed and sorted by node id, so a given snapshot always
/// yields the same tree within a run.
fn build_graph(
    snapshot: &HashMap<String, AgentRecord>,
    penalty_factor: f64,
) -> BTreeMap<String, Vec<(String, f64)>> {
    let mut graph: BTreeMap<String, Vec<(String, f64)>> = BTreeMap::new();
    for (agent_id, record) in snapshot {
        let edges = graph.entry(agent_id.clone()).or_default();
        for (target, metric) in &record.metrics {
            // Only currently-known agents are graph nodes.
            if !snapshot.contains_key(target) {
                continue;
            }
            let cost = edge_cost(metric.rtt_ms, metric.loss_rate, penalty_factor);
            if cost.is_finite() {
                edges.push((target.clone(), cost));
            }
        }
        edges.sort_by(|a, b| a.0.cmp(&b.0));
    }
    graph
}

/// f64 wrapper with a total order, for the Dijkstra heap.
#[derive(PartialEq)]
struct Cost(f64);

impl Eq for Cost {}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cost {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Single-source Dijkstra. Returns distances and predecessors for every
/// node reachable from `source`.
fn shortest_paths(
    graph: &BTreeMap<String, Vec<(String, f64)>>,
    source: &str,
) -> (HashMap<String, f64>, HashMap<String, String>) {
    let mut dist: HashMap<String, f64> = HashMap::new();
    let mut prev: HashMap<String, String> = HashMap::new();
    if !graph.contains_key(source) {
        return (dist, prev);
    }

    let mut heap: BinaryHeap<Reverse<(Cost, String)>> = BinaryHeap::new();
    dist.insert(source.to_string(), 0.0);
    heap.push(Reverse((Cost(0.0), source.to_string())));

    while let Some(Reverse((Cost(cost), node))) = heap.pop() {
        if cost > dist[&node] {
            continue; // stale heap entry
        }
        let Some(edges) = graph.get(&node) else {
            continue;
        };
        for (next, weight) in edges {
            let candidate = cost + weight;
            if dist
                .get(next)
                .map(|&current| candidate < current)
                .unwrap_or(true)
            {
                dist.insert(next.clone(), candidate);
                prev.insert(next.clone(), node.clone());
                heap.push(Reverse((Cost(candidate), next.clone())));
            }
        }
    }
    (dist, prev)
}

/// Walk predecessors back from `target` to `source`.
fn reconstruct_path(
    prev: &HashMap<String, String>,
    source: &str,
    target: &str,
) -> Option<Vec<String>> {
    let mut path = vec![target.to_string()];
    let mut node = target;
    while node != source {
        node = prev.get(node)?;
        path.push(node.to_string());
    }
    path.reverse();
    Some(path)
}

/// Turn a shortest path into a directive. A two-node path means the
/// target is best reached directly; a longer path relays through the
/// first intermediate hop.
fn derive_directive(path: &[String], target: &str) -> Option<RouteDirective> {
    let dst: Ipv4Addr = target.parse().ok()?;
    if path.len() == 2 {
        return Some(RouteDirective {
            dst_cidr: format!("{dst}/32"),
            next_hop: NextHop::Direct,
            reason: RouteReason::Default,
        });
    }
    let hop: Ipv4Addr = path[1].parse().ok()?;
    Some(RouteDirective {
        dst_cidr: format!("{dst}/32"),
        next_hop: NextHop::Via(hop),
        reason: RouteReason::OptimizedPath,
    })
}
