//! Common building blocks for broker-mediated inter-service calls
//!
//! - Service targets, tiers and deployment environments
//! - Tiered, environment-scaled deadline resolution
//! - Per-target circuit breaking with half-open recovery
//! - Broker contracts (request/response and fire-and-forget) plus an
//!   in-process broker
//! - Startup topology declaration
//! - RPC client tying the above together

pub mod broker;
pub mod clients;
pub mod config;
pub mod constants;
pub mod errors;
pub mod resilience;
pub mod timeouts;
pub mod topology;

pub use broker::{
    BrokerError, BrokerResult, Envelope, EventSink, LocalBroker, MessageMetadata, RequestChannel,
    RequestHandler,
};
pub use clients::{RetryPolicy, RpcClient, RpcError};
pub use config::{Environment, ServiceTarget, ServiceTier};
pub use errors::ServiceError;
pub use resilience::{
    BackoffStrategy, BreakerConfig, CallOutcome, CallResult, CircuitBreakerEngine,
    CircuitSnapshot, CircuitState, WindowCounts,
};
pub use timeouts::{OperationKind, TimeoutDebugInfo, TimeoutPolicy, TimeoutResolver};
pub use topology::{
    BindingSpec, Declaration, ExchangeKind, ExchangeSpec, QueueSpec, TopologyChannel,
    TopologyConfig, TopologyError, TopologyManager, TopologyReport,
};
