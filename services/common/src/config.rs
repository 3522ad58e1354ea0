//! Service targets and deployment environment

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::DEFAULT_RPC_EXCHANGE;

/// Static classification of a downstream service
///
/// Drives how aggressive its default deadlines are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceTier {
    Critical,
    Standard,
    NonCritical,
}

impl ServiceTier {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Standard => "standard",
            Self::NonCritical => "non_critical",
        }
    }
}

impl fmt::Display for ServiceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_exchange() -> String {
    DEFAULT_RPC_EXCHANGE.to_string()
}

/// A downstream service reachable over the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTarget {
    /// Service name, unique within the configured set
    pub name: String,
    /// Tier classification
    pub tier: ServiceTier,
    /// Exchange requests are published to
    #[serde(default = "default_exchange")]
    pub exchange: String,
    /// Routing key for health probes (defaults to `<name>.health`)
    #[serde(default)]
    pub health_routing_key: Option<String>,
}

impl ServiceTarget {
    pub fn new(name: impl Into<String>, tier: ServiceTier) -> Self {
        Self {
            name: name.into(),
            tier,
            exchange: default_exchange(),
            health_routing_key: None,
        }
    }

    #[must_use]
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Routing key the health probe is sent with
    #[must_use]
    pub fn health_key(&self) -> String {
        self.health_routing_key
            .clone()
            .unwrap_or_else(|| format!("{}.health", self.name))
    }

    /// Queue the service consumes its requests from
    #[must_use]
    pub fn request_queue(&self) -> String {
        format!("{}.requests", self.name)
    }

    /// Routing key for an arbitrary operation on this service
    #[must_use]
    pub fn routing_key(&self, operation: &str) -> String {
        format!("{}.{}", self.name, operation)
    }
}

/// The platform's default downstream set
#[must_use]
pub fn default_targets() -> Vec<ServiceTarget> {
    vec![
        ServiceTarget::new("auth", ServiceTier::Critical),
        ServiceTarget::new("billing", ServiceTier::Standard),
        ServiceTarget::new("deploy", ServiceTier::Standard),
        ServiceTarget::new("monitor", ServiceTier::NonCritical),
    ]
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Staging,
    Development,
    Test,
}

impl Environment {
    /// Lenient parse; anything unrecognised is treated as development
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "stage" | "staging" => Self::Staging,
            "test" | "testing" => Self::Test,
            _ => Self::Development,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Development => "development",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
