//! Configuration for the API Gateway

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use services_common::config::default_targets;
use services_common::constants::MILLIS_PER_SEC;
use services_common::{
    BreakerConfig, Environment, OperationKind, RetryPolicy, ServiceTarget, TimeoutPolicy,
    TimeoutResolver,
};

use crate::middleware::KeyStrategy;

/// API Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Deployment environment (production, staging, development, test)
    pub environment: String,
    /// Deadline policy for outbound calls
    pub timeouts: TimeoutPolicy,
    /// Circuit breaker thresholds and per-target overrides
    pub circuit_breaker: BreakerConfig,
    /// Retry behaviour of the RPC client
    pub rpc: RetryPolicy,
    /// Rate limiting configuration
    pub rate_limiting: RateLimitConfig,
    /// Downstream services probed by the health aggregator
    pub services: Vec<ServiceTarget>,
    /// Monitoring configuration
    pub monitoring: MonitoringConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// Maximum request body size in bytes
    pub max_body_size: usize,
    /// Enable compression
    pub compression: bool,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Shared store; the in-process store is used when absent
    pub redis_url: Option<String>,
    /// Fixed window length in seconds
    pub window_seconds: u64,
    /// Requests admitted per window
    pub limit: u64,
    /// Extra requests tolerated on top of `limit`
    pub burst: u64,
    /// How long a client stays blocked after exceeding the limit (0 disables)
    pub block_seconds: u64,
    /// Cost of one request
    pub points: u64,
    /// Client key derivation: `ip` or `header:<name>`
    pub key_strategy: KeyStrategy,
    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`.
    /// Only enable behind a proxy that overwrites these headers.
    pub trust_forwarded_headers: bool,
    /// Path prefixes never rate limited
    pub skip_paths: Vec<String>,
    /// Prefix of every key written to the store
    pub key_prefix: String,
}

/// Monitoring and metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Enable Prometheus metrics
    pub metrics_enabled: bool,
    /// Metrics endpoint path
    pub metrics_path: String,
    /// Health check endpoint path
    pub health_path: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            environment: Environment::Development.to_string(),
            timeouts: TimeoutPolicy::default(),
            circuit_breaker: BreakerConfig::default(),
            rpc: RetryPolicy::default(),
            rate_limiting: RateLimitConfig::default(),
            services: default_targets(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            timeout_seconds: 30,
            max_body_size: 1024 * 1024, // 1MB
            compression: true,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: None,
            window_seconds: 60,
            limit: 100,
            burst: 0,
            block_seconds: 0,
            points: 1,
            key_strategy: KeyStrategy::Ip,
            trust_forwarded_headers: false,
            skip_paths: vec!["/health/ready".to_string(), "/metrics".to_string()],
            key_prefix: "rl".to_string(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_path: "/metrics".to_string(),
            health_path: "/health".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from file, with `GATEWAY__` environment overrides
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("GATEWAY").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Get server address
    #[must_use]
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    #[must_use]
    pub fn deployment_environment(&self) -> Environment {
        Environment::parse(&self.environment)
    }

    /// Reject settings that cannot work together
    ///
    /// Every health check deadline must finish inside the server request
    /// timeout, otherwise `/health` is cut off with a 408.
    pub fn validate(&self) -> Result<()> {
        let resolver = TimeoutResolver::new(
            self.timeouts.clone(),
            self.deployment_environment(),
            &self.services,
        );
        let request_ms = self.server.timeout_seconds.saturating_mul(MILLIS_PER_SEC);

        let slowest = self
            .services
            .iter()
            .map(|target| {
                let deadline = resolver.resolve_ms(&target.name, OperationKind::HealthCheck);
                (target.name.as_str(), deadline)
            })
            .max_by_key(|(_, ms)| *ms);

        if let Some((name, deadline_ms)) = slowest {
            if deadline_ms >= request_ms {
                bail!(
                    "Health check deadline for '{}' ({}ms) must be below server.timeout_seconds ({}ms)",
                    name,
                    deadline_ms,
                    request_ms
                );
            }
        }

        Ok(())
    }
}
