//! Common error types for services

use thiserror::Error;

use crate::broker::BrokerError;

/// Service error types
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Connection failed error
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Service unavailable error
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Invalid request error
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Rate limited error
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Call rejected by an open circuit
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Target is not part of the configured service set
    #[error("Unknown service: {0}")]
    UnknownTarget(String),
}

impl ServiceError {
    /// Whether a retry could reasonably succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::ServiceUnavailable(_) | Self::Timeout(_)
        )
    }
}

impl From<BrokerError> for ServiceError {
    fn from(error: BrokerError) -> Self {
        match error {
            BrokerError::Timeout { .. } => Self::Timeout(error.to_string()),
            BrokerError::NoConsumer(_) | BrokerError::Remote(_) => {
                Self::ServiceUnavailable(error.to_string())
            }
            BrokerError::Channel(_) => Self::ConnectionFailed(error.to_string()),
            BrokerError::NoRoute { .. }
            | BrokerError::ExchangeNotFound(_)
            | BrokerError::QueueNotFound(_)
            | BrokerError::PreconditionFailed(_) => Self::InvalidRequest(error.to_string()),
            BrokerError::Serialization(_) => Self::InternalError(error.to_string()),
        }
    }
}
