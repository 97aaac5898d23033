//! In-memory topology store.
//!
//! Maps each agent id to its most recently accepted telemetry and the
//! wall-clock time of reception. Records are replaced atomically per
//! agent and evicted by the cleaner once stale. The store is the only
//! process-wide shared container in the controller; everything reading
//! it works on by-value snapshots.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};

use trellis_common::telemetry::TelemetryReport;

/// Smoothed measurements from one agent toward one target.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerMetric {
    pub rtt_ms: Option<f64>,
    pub loss_rate: f64,
}

/// The last accepted report of one agent.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub received_at: DateTime<Utc>,
    /// target tunnel IP → smoothed metric.
    pub metrics: HashMap<String, PeerMetric>,
}

#[derive(Default)]
pub struct TopologyStore {
    inner: RwLock<HashMap<String, AgentRecord>>,
}

impl TopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the record for the report's agent. Reception time is now.
    pub fn store_report(&self, report: &TelemetryReport) {
        self.store_report_at(report, Utc::now());
    }

    pub(crate) fn store_report_at(&self, report: &TelemetryReport, received_at: DateTime<Utc>) {
        let metrics = report
            .metrics
            .iter()
            .map(|m| {
                (
                    m.target_ip.clone(),
                    PeerMetric {
                        rtt_ms: m.rtt_ms,
                        loss_rate: m.loss_rate,
                    },
                )
            })
            .collect();
        let record = AgentRecord {
            received_at,
            metrics,
        };
        self.inner
            .write()
            .unwrap()
            .insert(report.agent_id.clone(), record);
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.inner.read().unwrap().get(agent_id).cloned()
    }

    pub fn exists(&self, agent_id: &str) -> bool {
        self.inner.read().unwrap().contains_key(agent_id)
    }

    pub fn count(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    /// Snapshot of the whole store. The caller may read freely while
    /// new writes proceed.
    pub fn get_all(&self) -> HashMap<String, AgentRecord> {
        self.inner.read().unwrap().clone()
    }

    /// Sorted agent ids, for stable logs and diffs.
    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Reception time of the freshest record, if any.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .unwrap()
            .values()
            .map(|r| r.received_at)
            .max()
    }

    /// Remove records older than `threshold`. Returns how many went.
    pub fn clean_stale(&self, threshold: Duration) -> usize {
        self.clean_stale_at(threshold, Utc::now())
    }

    fn clean_stale_at(&self, threshold: Duration, now: DateTime<Utc>) -> usize {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        let mut map = self.inner.write().unwrap();
        let before = map.len();
        map.retain(|_, record| now - record.received_at <= threshold);
        before - map.len()
    }
}
