//! Deadline resolution for outbound calls
//!
//! Deadlines come from a static tier mapping, optional per-target
//! overrides and an environment scale factor, and are always clamped to a
//! hard floor. Resolution is a pure function of its inputs; the resolver
//! holds no mutable state and can be shared freely.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::config::{Environment, ServiceTarget, ServiceTier};
use crate::constants::{
    CRITICAL_TIER_TIMEOUT_MS, DEFAULT_HEALTH_CHECK_TIMEOUT_MS, DEFAULT_OUTBOUND_HTTP_TIMEOUT_MS,
    DEFAULT_PUBLISH_TIMEOUT_MS, DEFAULT_RPC_CALL_TIMEOUT_MS, DEFAULT_STORAGE_OP_TIMEOUT_MS,
    DEVELOPMENT_TIMEOUT_SCALE, MIN_TIMEOUT_FLOOR_MS, NON_CRITICAL_TIER_TIMEOUT_MS,
    PRODUCTION_TIMEOUT_SCALE, STAGING_TIMEOUT_SCALE, STANDARD_TIER_TIMEOUT_MS, TEST_TIMEOUT_SCALE,
};

/// Kind of outbound operation a deadline is resolved for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    RpcCall,
    HealthCheck,
    StorageOp,
    OutboundHttp,
    Publish,
}

impl OperationKind {
    pub const ALL: [Self; 5] = [
        Self::RpcCall,
        Self::HealthCheck,
        Self::StorageOp,
        Self::OutboundHttp,
        Self::Publish,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RpcCall => "rpc_call",
            Self::HealthCheck => "health_check",
            Self::StorageOp => "storage_op",
            Self::OutboundHttp => "outbound_http",
            Self::Publish => "publish",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base deadline per tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTimeouts {
    pub critical_ms: u64,
    pub standard_ms: u64,
    pub non_critical_ms: u64,
}

impl Default for TierTimeouts {
    fn default() -> Self {
        Self {
            critical_ms: CRITICAL_TIER_TIMEOUT_MS,
            standard_ms: STANDARD_TIER_TIMEOUT_MS,
            non_critical_ms: NON_CRITICAL_TIER_TIMEOUT_MS,
        }
    }
}

impl TierTimeouts {
    #[must_use]
    pub const fn for_tier(&self, tier: ServiceTier) -> u64 {
        match tier {
            ServiceTier::Critical => self.critical_ms,
            ServiceTier::Standard => self.standard_ms,
            ServiceTier::NonCritical => self.non_critical_ms,
        }
    }
}

/// One deadline per operation kind
///
/// Used both for the generic fallbacks of unknown targets and, with every
/// field optional, for per-target overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationTimeouts {
    pub rpc_call_ms: u64,
    pub health_check_ms: u64,
    pub storage_op_ms: u64,
    pub outbound_http_ms: u64,
    pub publish_ms: u64,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self {
            rpc_call_ms: DEFAULT_RPC_CALL_TIMEOUT_MS,
            health_check_ms: DEFAULT_HEALTH_CHECK_TIMEOUT_MS,
            storage_op_ms: DEFAULT_STORAGE_OP_TIMEOUT_MS,
            outbound_http_ms: DEFAULT_OUTBOUND_HTTP_TIMEOUT_MS,
            publish_ms: DEFAULT_PUBLISH_TIMEOUT_MS,
        }
    }
}

impl OperationTimeouts {
    #[must_use]
    pub const fn for_operation(&self, operation: OperationKind) -> u64 {
        match operation {
            OperationKind::RpcCall => self.rpc_call_ms,
            OperationKind::HealthCheck => self.health_check_ms,
            OperationKind::StorageOp => self.storage_op_ms,
            OperationKind::OutboundHttp => self.outbound_http_ms,
            OperationKind::Publish => self.publish_ms,
        }
    }
}

/// Operation-specific deadlines for a single target
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetOverride {
    pub rpc_call_ms: Option<u64>,
    pub health_check_ms: Option<u64>,
    pub storage_op_ms: Option<u64>,
    pub outbound_http_ms: Option<u64>,
    pub publish_ms: Option<u64>,
}

impl TargetOverride {
    #[must_use]
    pub const fn for_operation(&self, operation: OperationKind) -> Option<u64> {
        match operation {
            OperationKind::RpcCall => self.rpc_call_ms,
            OperationKind::HealthCheck => self.health_check_ms,
            OperationKind::StorageOp => self.storage_op_ms,
            OperationKind::OutboundHttp => self.outbound_http_ms,
            OperationKind::Publish => self.publish_ms,
        }
    }
}

/// Environment multipliers applied when scaling is enabled
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleFactors {
    pub production: f64,
    pub staging: f64,
    pub development: f64,
    pub test: f64,
}

impl Default for ScaleFactors {
    fn default() -> Self {
        Self {
            production: PRODUCTION_TIMEOUT_SCALE,
            staging: STAGING_TIMEOUT_SCALE,
            development: DEVELOPMENT_TIMEOUT_SCALE,
            test: TEST_TIMEOUT_SCALE,
        }
    }
}

impl ScaleFactors {
    #[must_use]
    pub const fn for_environment(&self, environment: Environment) -> f64 {
        match environment {
            Environment::Production => self.production,
            Environment::Staging => self.staging,
            Environment::Development => self.development,
            Environment::Test => self.test,
        }
    }
}

/// Immutable timeout configuration, loaded once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    /// Apply the environment scale factor
    pub scaling_enabled: bool,
    /// Base deadline per tier
    pub tiers: TierTimeouts,
    /// Generic defaults for targets outside the tier mapping
    pub operation_defaults: OperationTimeouts,
    /// Per-target, per-operation overrides
    pub overrides: FxHashMap<String, TargetOverride>,
    /// Environment multipliers
    pub scale: ScaleFactors,
    /// Lower bound for every deadline; never below 500ms
    pub floor_ms: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            scaling_enabled: true,
            tiers: TierTimeouts::default(),
            operation_defaults: OperationTimeouts::default(),
            overrides: FxHashMap::default(),
            scale: ScaleFactors::default(),
            floor_ms: MIN_TIMEOUT_FLOOR_MS,
        }
    }
}

/// Resolves deadlines for (target, operation) pairs
#[derive(Debug, Clone)]
pub struct TimeoutResolver {
    policy: TimeoutPolicy,
    environment: Environment,
    tiers: FxHashMap<String, ServiceTier>,
}

impl TimeoutResolver {
    pub fn new(policy: TimeoutPolicy, environment: Environment, targets: &[ServiceTarget]) -> Self {
        let tiers = targets
            .iter()
            .map(|target| (target.name.clone(), target.tier))
            .collect();

        Self {
            policy,
            environment,
            tiers,
        }
    }

    #[must_use]
    pub const fn environment(&self) -> Environment {
        self.environment
    }

    #[must_use]
    pub const fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    #[must_use]
    pub fn tier_of(&self, target: &str) -> Option<ServiceTier> {
        self.tiers.get(target).copied()
    }

    /// Effective multiplier, 1.0 when scaling is disabled
    #[must_use]
    pub fn scale_factor(&self) -> f64 {
        if self.policy.scaling_enabled {
            self.policy.scale.for_environment(self.environment)
        } else {
            1.0
        }
    }

    #[must_use]
    pub fn floor_ms(&self) -> u64 {
        self.policy.floor_ms.max(MIN_TIMEOUT_FLOOR_MS)
    }

    /// Deadline in milliseconds
    #[must_use]
    pub fn resolve_ms(&self, target: &str, operation: OperationKind) -> u64 {
        let overridden = self
            .policy
            .overrides
            .get(target)
            .and_then(|entry| entry.for_operation(operation));

        let base = match (overridden, self.tier_of(target)) {
            (Some(ms), _) => ms,
            (None, Some(tier)) => self.policy.tiers.for_tier(tier),
            (None, None) => self.policy.operation_defaults.for_operation(operation),
        };

        let factor = self.scale_factor();
        let scaled = if factor.is_finite() && factor > 0.0 {
            (base as f64 * factor).round() as u64
        } else {
            base
        };

        scaled.max(self.floor_ms())
    }

    #[must_use]
    pub fn resolve(&self, target: &str, operation: OperationKind) -> Duration {
        Duration::from_millis(self.resolve_ms(target, operation))
    }

    /// Per-target breakdown for debug endpoints
    #[must_use]
    pub fn describe(&self) -> TimeoutDebugInfo {
        let services = self
            .tiers
            .iter()
            .map(|(name, tier)| {
                let timeouts = OperationKind::ALL
                    .iter()
                    .map(|op| (op.as_str().to_string(), self.resolve_ms(name, *op)))
                    .collect();
                (
                    name.clone(),
                    TargetTimeouts {
                        tier: *tier,
                        has_override: self.policy.overrides.contains_key(name),
                        timeouts,
                    },
                )
            })
            .collect();

        TimeoutDebugInfo {
            environment: self.environment,
            scaling_enabled: self.policy.scaling_enabled,
            scale_factor: self.scale_factor(),
            floor_ms: self.floor_ms(),
            services,
        }
    }
}

/// Resolved deadlines of one target
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetTimeouts {
    pub tier: ServiceTier,
    pub has_override: bool,
    pub timeouts: BTreeMap<String, u64>,
}

/// Snapshot of the resolver configuration
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutDebugInfo {
    pub environment: Environment,
    pub scaling_enabled: bool,
    pub scale_factor: f64,
    pub floor_ms: u64,
    pub services: BTreeMap<String, TargetTimeouts>,
}
