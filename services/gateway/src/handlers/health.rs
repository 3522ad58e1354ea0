//! Health check and monitoring handlers

use axum::{extract::State, http::StatusCode, response::Json};
use services_common::TimeoutDebugInfo;
use tracing::debug;

use crate::health::{AggregatedHealthReport, CircuitDebugInfo, HealthAggregator};
use crate::models::ReadinessResponse;

/// Health check handlers
#[derive(Clone, Debug)]
pub struct HealthHandlers {
    aggregator: HealthAggregator,
}

impl HealthHandlers {
    #[must_use]
    pub const fn new(aggregator: HealthAggregator) -> Self {
        Self { aggregator }
    }

    /// Aggregated system health, always 200 with a descriptive body
    pub async fn health_check(State(handlers): State<Self>) -> Json<AggregatedHealthReport> {
        debug!("Health check request");
        Json(handlers.aggregator.check_all().await)
    }

    /// Readiness without any downstream call
    pub async fn readiness() -> Json<ReadinessResponse> {
        Json(ReadinessResponse::ready())
    }

    pub async fn circuit_breakers(State(handlers): State<Self>) -> Json<CircuitDebugInfo> {
        Json(handlers.aggregator.get_circuit_debug_info())
    }

    pub async fn recommendations(State(handlers): State<Self>) -> Json<Vec<String>> {
        Json(handlers.aggregator.get_recommendations())
    }

    pub async fn timeouts(State(handlers): State<Self>) -> Json<TimeoutDebugInfo> {
        Json(handlers.aggregator.get_timeout_debug_info())
    }

    /// Prometheus metrics endpoint
    pub async fn metrics() -> Result<String, StatusCode> {
        #[cfg(feature = "monitoring")]
        {
            crate::metrics::render().ok_or(StatusCode::SERVICE_UNAVAILABLE)
        }
        #[cfg(not(feature = "monitoring"))]
        {
            Err(StatusCode::NOT_FOUND)
        }
    }
}
