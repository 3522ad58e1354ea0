//! API Gateway for the broker RPC control plane
//!
//! Ingress in front of broker-mediated services.
//! Features:
//! - Fixed-window rate limiting shared through Redis
//! - Parallel health aggregation guarded by per-service circuit breakers
//! - Circuit breaker administration and debug endpoints
//! - Prometheus metrics

#![allow(missing_docs)]

pub mod config;
pub mod demo;
pub mod handlers;
pub mod health;
#[cfg(feature = "monitoring")]
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod rate_limiter;
pub mod server;

pub use config::{GatewayConfig, MonitoringConfig, RateLimitConfig, ServerConfig};
pub use health::{AggregatedHealthReport, HealthAggregator, HealthProbeResult, HealthStatus};
pub use rate_limiter::{RateLimitOptions, RateLimitResult, RateLimiter};
pub use server::{ApiGatewayServer, BrokerHandles};
