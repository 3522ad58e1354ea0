//! Parallel health probing of every configured target

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use services_common::{
    CallResult, CircuitBreakerEngine, CircuitSnapshot, CircuitState, RpcClient, ServiceError,
    ServiceTarget, TimeoutDebugInfo,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{AggregatedHealthReport, HealthProbeResult, HealthStatus, ProbeMetadata, reduce_status};

/// Counts of circuits per state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSummary {
    pub open: usize,
    pub half_open: usize,
    pub closed: usize,
}

/// Breaker overview served by `/health/circuit-breakers`
#[derive(Debug, Clone, Serialize)]
pub struct CircuitDebugInfo {
    pub summary: CircuitSummary,
    pub services: BTreeMap<String, CircuitSnapshot>,
}

/// Result of an administrative circuit reset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetOutcome {
    pub success: bool,
    pub message: String,
    pub reset_count: usize,
}

/// Issues health probes and reduces them into one report
#[derive(Clone)]
pub struct HealthAggregator {
    client: RpcClient,
    targets: Arc<Vec<ServiceTarget>>,
}

impl std::fmt::Debug for HealthAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthAggregator")
            .field("targets", &self.targets.len())
            .finish()
    }
}

impl HealthAggregator {
    #[must_use]
    pub fn new(client: RpcClient, targets: Vec<ServiceTarget>) -> Self {
        Self {
            client,
            targets: Arc::new(targets),
        }
    }

    #[must_use]
    pub fn targets(&self) -> &[ServiceTarget] {
        &self.targets
    }

    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerEngine> {
        self.client.breakers()
    }

    fn target(&self, name: &str) -> Option<&ServiceTarget> {
        self.targets.iter().find(|target| target.name == name)
    }

    /// Probe every target concurrently and reduce the results
    ///
    /// Never fails: unreachable targets become unhealthy entries.
    pub async fn check_all(&self) -> AggregatedHealthReport {
        let started = Instant::now();
        let results = join_all(self.targets.iter().map(|target| self.check_target(target))).await;

        let services: BTreeMap<String, HealthProbeResult> = results
            .into_iter()
            .map(|result| (result.service.clone(), result))
            .collect();
        let status = reduce_status(services.values().map(|result| &result.status));

        info!(
            status = %status,
            services = services.len(),
            duration_ms = started.elapsed().as_millis(),
            "Health check completed"
        );
        #[cfg(feature = "monitoring")]
        crate::metrics::get_metrics().record_health_check(status, started.elapsed().as_secs_f64());

        AggregatedHealthReport {
            status,
            services,
            timestamp: Utc::now(),
        }
    }

    /// Probe one target, short-circuiting when its breaker is open
    pub async fn check_target(&self, target: &ServiceTarget) -> HealthProbeResult {
        if !self.breakers().is_call_permitted(&target.name) {
            debug!(service = %target.name, "Circuit open, skipping health probe");
            return self.circuit_open_result(target);
        }

        let outcome = self.client.health_check(target).await;
        let response_time_ms = u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX);
        let circuit_state = outcome.state;

        let result = match outcome.result {
            CallResult::Success(reply) => {
                Self::from_reply(target, reply, response_time_ms, circuit_state)
            }
            CallResult::Failure(error) => {
                warn!(service = %target.name, error = %error, "Health probe failed");
                HealthProbeResult {
                    status: HealthStatus::Unhealthy,
                    service: target.name.clone(),
                    timestamp: Utc::now(),
                    metadata: ProbeMetadata {
                        error: Some(error.to_string()),
                        exchange: Some(target.exchange.clone()),
                        routing_key: Some(target.health_key()),
                        response_time_ms: Some(response_time_ms),
                        circuit_state: Some(circuit_state),
                        ..ProbeMetadata::default()
                    },
                }
            }
            // Lost the race with another caller for the half-open probe
            CallResult::Rejected | CallResult::Fallback(_) => self.circuit_open_result(target),
        };

        #[cfg(feature = "monitoring")]
        crate::metrics::get_metrics().record_probe(&target.name, result.status);

        result
    }

    fn circuit_open_result(&self, target: &ServiceTarget) -> HealthProbeResult {
        let snapshot = self.breakers().get_state(&target.name);
        HealthProbeResult {
            status: HealthStatus::Unhealthy,
            service: target.name.clone(),
            timestamp: Utc::now(),
            metadata: ProbeMetadata {
                error: Some(ServiceError::CircuitOpen(target.name.clone()).to_string()),
                exchange: Some(target.exchange.clone()),
                routing_key: Some(target.health_key()),
                circuit_breaker: true,
                circuit_state: Some(snapshot.state),
                details: snapshot.next_probe_in_ms.map(|ms| serde_json::json!({"nextProbeInMs": ms})),
                ..ProbeMetadata::default()
            },
        }
    }

    fn from_reply(
        target: &ServiceTarget,
        reply: Value,
        response_time_ms: u64,
        circuit_state: CircuitState,
    ) -> HealthProbeResult {
        let (status, details) = match reply {
            Value::Object(mut fields) => {
                let status = fields
                    .remove("status")
                    .as_ref()
                    .and_then(Value::as_str)
                    .and_then(HealthStatus::parse)
                    .unwrap_or(HealthStatus::Healthy);
                let details = (!fields.is_empty()).then(|| Value::Object(fields));
                (status, details)
            }
            Value::Null => (HealthStatus::Healthy, None),
            other => (HealthStatus::Healthy, Some(other)),
        };

        let error = (status != HealthStatus::Healthy).then(|| {
            details
                .as_ref()
                .and_then(|d| d.get("error").or_else(|| d.get("message")))
                .and_then(Value::as_str)
                .map_or_else(|| format!("service reported {status}"), str::to_string)
        });

        HealthProbeResult {
            status,
            service: target.name.clone(),
            timestamp: Utc::now(),
            metadata: ProbeMetadata {
                error,
                exchange: Some(target.exchange.clone()),
                routing_key: Some(target.health_key()),
                response_time_ms: Some(response_time_ms),
                circuit_state: Some(circuit_state),
                details,
                ..ProbeMetadata::default()
            },
        }
    }

    /// Resolved deadlines of every configured target
    #[must_use]
    pub fn get_timeout_debug_info(&self) -> TimeoutDebugInfo {
        self.client.timeouts().describe()
    }

    /// Breaker state of every configured target plus any other known circuit
    #[must_use]
    pub fn get_circuit_debug_info(&self) -> CircuitDebugInfo {
        let breakers = self.breakers();
        let mut services = breakers.get_all_states();
        for target in self.targets.iter() {
            if !services.contains_key(&target.name) {
                services.insert(target.name.clone(), breakers.get_state(&target.name));
            }
        }

        let mut summary = CircuitSummary::default();
        for snapshot in services.values() {
            match snapshot.state {
                CircuitState::Open => summary.open += 1,
                CircuitState::HalfOpen => summary.half_open += 1,
                CircuitState::Closed => summary.closed += 1,
            }
        }

        CircuitDebugInfo { summary, services }
    }

    /// Operator guidance derived from current breaker state
    #[must_use]
    pub fn get_recommendations(&self) -> Vec<String> {
        let info = self.get_circuit_debug_info();
        let config = self.breakers().config();
        let mut recommendations = Vec::new();

        for (name, snapshot) in &info.services {
            match snapshot.state {
                CircuitState::Open if snapshot.locked => recommendations.push(format!(
                    "{name} is locked OPEN after {} failed recovery attempts; fix the service and reset the circuit manually",
                    snapshot.recovery_attempts
                )),
                CircuitState::Open => recommendations.push(format!(
                    "{name} has been OPEN for {}ms; consider investigating before resuming traffic (next probe in {}ms)",
                    snapshot.open_for_ms.unwrap_or_default(),
                    snapshot.next_probe_in_ms.unwrap_or_default()
                )),
                CircuitState::HalfOpen => recommendations.push(format!(
                    "{name} is HALF_OPEN; a recovery probe is in flight, avoid resetting it manually"
                )),
                CircuitState::Closed => {
                    let threshold = config.settings_for(name).error_threshold_percentage;
                    if snapshot.counts.failures > 0 && snapshot.failure_percentage >= threshold / 2.0 {
                        recommendations.push(format!(
                            "{name} is failing {:.1}% of calls (trips at {threshold:.1}%); check its logs",
                            snapshot.failure_percentage
                        ));
                    }
                }
            }
        }

        if recommendations.is_empty() {
            recommendations.push("All circuits are healthy; no action needed".to_string());
        }
        recommendations
    }

    /// Force a target's circuit closed
    ///
    /// Unknown targets are reported, not raised.
    #[must_use]
    pub fn reset_circuit(&self, name: &str) -> ResetOutcome {
        if self.target(name).is_none() {
            let error = ServiceError::UnknownTarget(name.to_string());
            warn!(service = %name, "Circuit reset requested for unknown service");
            return ResetOutcome {
                success: false,
                message: error.to_string(),
                reset_count: 0,
            };
        }

        let previous = self.breakers().state_of(name);
        let reset_count = self.breakers().reset(name);
        let message = if previous == CircuitState::Closed {
            format!("Circuit breaker for {name} was already closed")
        } else {
            format!("Circuit breaker for {name} reset from {previous} to closed")
        };
        info!(service = %name, previous = %previous, reset_count, "Circuit reset by operator");

        ResetOutcome {
            success: true,
            message,
            reset_count,
        }
    }
}
