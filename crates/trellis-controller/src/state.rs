//! Shared application state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::ControllerConfig;
use crate::solver::RouteSolver;
use crate::store::TopologyStore;

/// State shared across all request handlers and the cleaner task.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    config: ControllerConfig,
    store: TopologyStore,
    solver: RouteSolver,
    cleaner: CleanerStats,
    started_at: DateTime<Utc>,
    reports_accepted: AtomicU64,
    routes_served: AtomicU64,
}

impl AppState {
    pub fn new(config: ControllerConfig) -> Self {
        let solver = RouteSolver::new(config.penalty_factor, config.hysteresis);
        Self {
            inner: Arc::new(Inner {
                config,
                store: TopologyStore::new(),
                solver,
                cleaner: CleanerStats::default(),
                started_at: Utc::now(),
                reports_accepted: AtomicU64::new(0),
                routes_served: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &TopologyStore {
        &self.inner.store
    }

    pub fn solver(&self) -> &RouteSolver {
        &self.inner.solver
    }

    pub fn cleaner_stats(&self) -> &CleanerStats {
        &self.inner.cleaner
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn record_report_accepted(&self) {
        self.inner.reports_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reports_accepted(&self) -> u64 {
        self.inner.reports_accepted.load(Ordering::Relaxed)
    }

    pub fn record_routes_served(&self) {
        self.inner.routes_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn routes_served(&self) -> u64 {
        self.inner.routes_served.load(Ordering::Relaxed)
    }
}

/// Monotonic counters maintained by the cleaner task, exposed on /health.
#[derive(Default)]
pub struct CleanerStats {
    runs: AtomicU64,
    removed_total: AtomicU64,
    last_run: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl CleanerStats {
    pub fn record_run(&self, removed: usize) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.removed_total
            .fetch_add(removed as u64, Ordering::Relaxed);
        *self.last_run.lock().unwrap() = Some(Utc::now());
    }

    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn removed_total(&self) -> u64 {
        self.removed_total.load(Ordering::Relaxed)
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.last_run.lock().unwrap()
    }
}
