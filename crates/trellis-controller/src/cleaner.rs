//! Stale-record eviction.
//!
//! An agent that stops reporting — crashed, partitioned, decommissioned —
//! must not keep steering other agents' routes. The cleaner periodically
//! evicts records older than the stale threshold and logs exactly which
//! agents disappeared.

use std::collections::HashSet;

use crate::state::AppState;

/// Run the eviction loop. Never returns; run under `tokio::spawn`.
pub async fn run(state: AppState) {
    let interval = state.config().cleaner_interval;
    let threshold = state.config().stale_threshold;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        interval_s = interval.as_secs(),
        threshold_s = threshold.as_secs(),
        "cleaner started"
    );

    loop {
        ticker.tick().await;

        let before: HashSet<String> = state.store().agent_ids().into_iter().collect();
        let removed = state.store().clean_stale(threshold);
        state.cleaner_stats().record_run(removed);

        if removed > 0 {
            let after: HashSet<String> = state.store().agent_ids().into_iter().collect();
            let mut evicted: Vec<&String> = before.difference(&after).collect();
            evicted.sort();
            tracing::info!(removed, evicted = ?evicted, "evicted stale agents");
        } else {
            tracing::debug!(agents = state.store().count(), "no stale agents");
        }
    }
}
