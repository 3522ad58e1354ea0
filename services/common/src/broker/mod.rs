//! Broker contracts for inter-service communication
//!
//! Two distinct contracts are consumed by the control plane:
//! - [`RequestChannel`]: request/response with a deadline
//! - [`EventSink`]: fire-and-forget, non-blocking enqueue
//!
//! [`LocalBroker`] is an in-process implementation of both, plus the
//! topology contract, with exchanges, bindings, message TTL, max length and
//! dead-letter routing.

pub mod local;
pub mod metrics;
pub mod router;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub use local::LocalBroker;
pub use metrics::BrokerMetrics;
pub use router::topic_matches;

/// Message metadata carried with every envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Message ID
    pub message_id: String,
    /// Source service
    pub source: String,
    /// Correlation ID for request tracing
    pub correlation_id: Option<String>,
    /// Enqueue timestamp (milliseconds since epoch)
    pub timestamp_ms: u64,
    /// Message TTL in milliseconds
    pub ttl_ms: Option<u64>,
    /// Custom headers
    pub headers: FxHashMap<String, String>,
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            source: "unknown".to_string(),
            correlation_id: None,
            timestamp_ms: now_millis(),
            ttl_ms: None,
            headers: FxHashMap::default(),
        }
    }
}

/// A routed message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Value,
    pub metadata: MessageMetadata,
}

impl Envelope {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, payload: Value) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            metadata: MessageMetadata::default(),
        }
    }

    /// Message age in milliseconds
    #[must_use]
    pub fn age_ms(&self) -> u64 {
        now_millis().saturating_sub(self.metadata.timestamp_ms)
    }
}

/// Error types for broker operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// No reply within the deadline
    #[error("Request to {exchange}/{routing_key} timed out after {timeout_ms}ms")]
    Timeout {
        exchange: String,
        routing_key: String,
        timeout_ms: u64,
    },

    /// Nothing bound for the routing key
    #[error("No route for {exchange}/{routing_key}")]
    NoRoute {
        exchange: String,
        routing_key: String,
    },

    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Queue exists but nobody consumes requests from it
    #[error("No consumer on queue: {0}")]
    NoConsumer(String),

    /// The remote handler returned an error
    #[error("Remote handler failed: {0}")]
    Remote(String),

    /// Redeclaration with different arguments
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BrokerError {
    /// Whether retrying the same request could succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::NoConsumer(_) | Self::Remote(_) | Self::Channel(_))
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Result type for broker operations
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Request/response over the broker, bounded by a deadline
#[async_trait]
pub trait RequestChannel: Send + Sync {
    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Value,
        timeout: Duration,
    ) -> BrokerResult<Value>;
}

/// One-way event emission; enqueues and returns without waiting
pub trait EventSink: Send + Sync {
    fn publish(&self, exchange: &str, routing_key: &str, payload: Value) -> BrokerResult<()>;
}

/// Server side of a request/response exchange
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle a request and produce the reply payload
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<Value>;

    /// Get handler name for debugging
    fn name(&self) -> &str;
}

pub(crate) fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
