//! System health model and reduction
//!
//! The aggregator fans out one probe per target and reduces the results with
//! [`reduce_status`]. The reduction only counts statuses, so it is independent
//! of target order.

mod aggregator;

pub use aggregator::{CircuitDebugInfo, CircuitSummary, HealthAggregator, ResetOutcome};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use services_common::CircuitState;
use std::collections::BTreeMap;
use std::fmt;

/// Health of one service or of the whole system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    /// Lenient parse of a status reported by a service
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "healthy" | "ok" | "up" => Some(Self::Healthy),
            "degraded" => Some(Self::Degraded),
            "unhealthy" | "down" => Some(Self::Unhealthy),
            _ => None,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Probe context attached to a result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProbeMetadata {
    /// Failure description, only set on non-healthy results
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
    /// Result synthesized from an open circuit, no probe was sent
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub circuit_breaker: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_state: Option<CircuitState>,
    /// Extra fields of the service's reply
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Health of one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthProbeResult {
    pub status: HealthStatus,
    pub service: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: ProbeMetadata,
}

impl HealthProbeResult {
    #[must_use]
    pub fn is_circuit_derived(&self) -> bool {
        self.metadata.circuit_breaker
    }
}

/// System-wide health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedHealthReport {
    pub status: HealthStatus,
    pub services: BTreeMap<String, HealthProbeResult>,
    pub timestamp: DateTime<Utc>,
}

/// Reduce per-target statuses into the system status
///
/// Nothing degraded or unhealthy is healthy; at least half unhealthy is
/// unhealthy; anything in between is degraded. An empty set is healthy.
pub fn reduce_status<'a>(statuses: impl IntoIterator<Item = &'a HealthStatus>) -> HealthStatus {
    let (mut total, mut degraded, mut unhealthy) = (0usize, 0usize, 0usize);
    for status in statuses {
        total += 1;
        match status {
            HealthStatus::Healthy => {}
            HealthStatus::Degraded => degraded += 1,
            HealthStatus::Unhealthy => unhealthy += 1,
        }
    }

    if unhealthy == 0 && degraded == 0 {
        HealthStatus::Healthy
    } else if unhealthy * 2 >= total {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}
