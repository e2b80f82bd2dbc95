//! Health check for the event bus.

use crate::metrics::MetricsSnapshot;
use serde::Serialize;

/// Health status of the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Functional, but some subscribers could not keep up.
    Degraded { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Health check result with details.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    #[serde(flatten)]
    pub status: HealthStatus,
    pub metrics: MetricsSnapshot,
}

impl HealthCheck {
    pub fn from_metrics(metrics: MetricsSnapshot) -> Self {
        let status = if metrics.subscribers_dropped > 0 {
            HealthStatus::Degraded {
                reason: format!(
                    "{} slow subscribers dropped",
                    metrics.subscribers_dropped
                ),
            }
        } else {
            HealthStatus::Healthy
        };

        Self { status, metrics }
    }
}
