//! Health reporting model shared by the agent and the controller.
//!
//! Both processes expose `GET /health` with the same shape: an overall
//! status, a map of per-component statuses with free-form details, and
//! an RFC 3339 timestamp. Aggregation is worst-of: one unhealthy
//! component makes the whole report unhealthy.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered worst-last so that `max` picks the dominating state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthState,
    pub details: serde_json::Value,
    pub last_check: DateTime<Utc>,
}

impl ComponentHealth {
    pub fn new(status: HealthState, details: serde_json::Value) -> Self {
        Self {
            status,
            details,
            last_check: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub components: BTreeMap<String, ComponentHealth>,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// Build a report from components, aggregating the overall status.
    pub fn from_components(components: BTreeMap<String, ComponentHealth>) -> Self {
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthState::Healthy);
        Self {
            status,
            components,
            timestamp: Utc::now(),
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        self.status == HealthState::Unhealthy
    }
}
