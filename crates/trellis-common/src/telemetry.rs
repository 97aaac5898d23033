//! Telemetry wire types.
//!
//! An agent pushes one [`TelemetryReport`] per telemetry tick:
//! `POST /api/v1/telemetry`. The report carries the smoothed per-peer
//! measurements, not raw probe results — smoothing happens on the agent.
//!
//! An absent RTT is a distinguished state, not zero: it means every
//! sample in the window timed out. On the wire it is JSON `null`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smoothed measurements toward one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    /// Tunnel IP of the probed peer.
    pub target_ip: String,
    /// Smoothed round-trip time in milliseconds; `null` when every
    /// sample in the window timed out.
    pub rtt_ms: Option<f64>,
    /// Smoothed loss fraction in `[0, 1]`.
    pub loss_rate: f64,
}

/// One telemetry push from an agent to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReport {
    /// Tunnel IP of the reporting agent, doubling as its identity.
    pub agent_id: String,
    /// Seconds since the Unix epoch at capture time.
    pub timestamp: i64,
    /// One entry per probed peer. Never empty in a valid report.
    pub metrics: Vec<MetricSample>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("agent_id must not be empty")]
    EmptyAgentId,
    #[error("timestamp must be a positive epoch second, got {0}")]
    NonPositiveTimestamp(i64),
    #[error("metrics must not be empty")]
    EmptyMetrics,
    #[error("metrics[{0}]: target_ip must not be empty")]
    EmptyTarget(usize),
    #[error("metric for {target}: rtt_ms must be non-negative, got {rtt_ms}")]
    NegativeRtt { target: String, rtt_ms: f64 },
    #[error("metric for {target}: loss_rate must be within [0, 1], got {loss_rate}")]
    LossOutOfRange { target: String, loss_rate: f64 },
}

impl TelemetryReport {
    /// Check the report invariants. Called at the HTTP boundary; a
    /// failing report is rejected with 400 and never reaches the store.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.agent_id.is_empty() {
            return Err(ValidationError::EmptyAgentId);
        }
        if self.timestamp <= 0 {
            return Err(ValidationError::NonPositiveTimestamp(self.timestamp));
        }
        if self.metrics.is_empty() {
            return Err(ValidationError::EmptyMetrics);
        }
        for (i, m) in self.metrics.iter().enumerate() {
            if m.target_ip.is_empty() {
                return Err(ValidationError::EmptyTarget(i));
            }
            if let Some(rtt) = m.rtt_ms {
                if rtt < 0.0 || !rtt.is_finite() {
                    return Err(ValidationError::NegativeRtt {
                        target: m.target_ip.clone(),
                        rtt_ms: rtt,
                    });
                }
            }
            if !(0.0..=1.0).contains(&m.loss_rate) || !m.loss_rate.is_finite() {
                return Err(ValidationError::LossOutOfRange {
                    target: m.target_ip.clone(),
                    loss_rate: m.loss_rate,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_report() -> TelemetryReport {
        TelemetryReport {
            agent_id: "10.254.0.1".into(),
            timestamp: 1_700_000_000,
            metrics: vec![
                MetricSample {
                    target_ip: "10.254.0.2".into(),
                    rtt_ms: Some(12.5),
                    loss_rate: 0.0,
                },
                MetricSample {
                    target_ip: "10.254.0.3".into(),
                    rtt_ms: None,
                    loss_rate: 1.0,
                },
            ],
        }
    }

    #[test]
    fn valid_report_passes() {
        assert_eq!(valid_report().validate(), Ok(()));
    }

    #[test]
    fn serde_round_trip_preserves_absent_rtt() {
        let report = valid_report();
        let json = serde_json::to_string(&report).unwrap();
        // Absent RTT is a distinguished null, not a missing key.
        assert!(json.contains(r#""rtt_ms":null"#));
        let back: TelemetryReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn rejects_empty_agent_id() {
        let mut r = valid_report();
        r.agent_id.clear();
        assert_eq!(r.validate(), Err(ValidationError::EmptyAgentId));
    }

    #[test]
    fn rejects_non_positive_timestamp() {
        let mut r = valid_report();
        r.timestamp = 0;
        assert_eq!(r.validate(), Err(ValidationError::NonPositiveTimestamp(0)));
    }

    #[test]
    fn rejects_empty_metrics() {
        let mut r = valid_report();
        r.metrics.clear();
        assert_eq!(r.validate(), Err(ValidationError::EmptyMetrics));
    }

    #[test]
    fn rejects_negative_rtt_with_rtt_in_message() {
        let mut r = valid_report();
        r.metrics[0].rtt_ms = Some(-10.0);
        let err = r.validate().unwrap_err();
        assert!(err.to_string().contains("rtt_ms"));
    }

    #[test]
    fn rejects_loss_out_of_range_with_loss_in_message() {
        let mut r = valid_report();
        r.metrics[0].loss_rate = 1.5;
        let err = r.validate().unwrap_err();
        assert!(err.to_string().contains("loss_rate"));
    }

    #[test]
    fn rejects_nan_loss() {
        let mut r = valid_report();
        r.metrics[0].loss_rate = f64::NAN;
        assert!(r.validate().is_err());
    }
}
