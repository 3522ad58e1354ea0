//! Administrative handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use tracing::info;

use crate::health::{HealthAggregator, ResetOutcome};

/// Circuit administration handlers
#[derive(Clone, Debug)]
pub struct AdminHandlers {
    aggregator: HealthAggregator,
}

impl AdminHandlers {
    #[must_use]
    pub const fn new(aggregator: HealthAggregator) -> Self {
        Self { aggregator }
    }

    /// Force a service's circuit closed
    ///
    /// Unknown services answer 404 with `success: false`.
    pub async fn reset_circuit(
        State(handlers): State<Self>,
        Path(service_name): Path<String>,
    ) -> (StatusCode, Json<ResetOutcome>) {
        info!(service = %service_name, "Circuit reset request");
        let outcome = handlers.aggregator.reset_circuit(&service_name);
        let status = if outcome.success {
            StatusCode::OK
        } else {
            StatusCode::NOT_FOUND
        };
        (status, Json(outcome))
    }
}
