//! Circuit breaker configuration

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_ERROR_THRESHOLD_PERCENTAGE, DEFAULT_MAX_RESET_TIMEOUT_MS,
    DEFAULT_RESET_TIMEOUT_MS, DEFAULT_ROLLING_BUCKETS, DEFAULT_ROLLING_WINDOW_MS,
    DEFAULT_VOLUME_THRESHOLD,
};

/// Growth of the reset timeout after consecutive failed probes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    None,
    Linear,
    Exponential,
}

/// Engine-wide breaker configuration with per-target overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Minimum invoked calls in the window before the breaker may trip
    pub volume_threshold: u64,
    /// Failure percentage at or above which the breaker trips
    pub error_threshold_percentage: f64,
    pub reset_timeout_ms: u64,
    pub rolling_window_ms: u64,
    pub rolling_buckets: usize,
    pub backoff: BackoffStrategy,
    pub backoff_multiplier: f64,
    pub max_reset_timeout_ms: u64,
    /// Failed probes after which the circuit stays open until reset
    pub max_recovery_attempts: Option<u32>,
    pub overrides: FxHashMap<String, BreakerOverride>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            volume_threshold: DEFAULT_VOLUME_THRESHOLD,
            error_threshold_percentage: DEFAULT_ERROR_THRESHOLD_PERCENTAGE,
            reset_timeout_ms: DEFAULT_RESET_TIMEOUT_MS,
            rolling_window_ms: DEFAULT_ROLLING_WINDOW_MS,
            rolling_buckets: DEFAULT_ROLLING_BUCKETS,
            backoff: BackoffStrategy::None,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_reset_timeout_ms: DEFAULT_MAX_RESET_TIMEOUT_MS,
            max_recovery_attempts: None,
            overrides: FxHashMap::default(),
        }
    }
}

/// Per-target replacement for any of the engine-wide values
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerOverride {
    pub volume_threshold: Option<u64>,
    pub error_threshold_percentage: Option<f64>,
    pub reset_timeout_ms: Option<u64>,
    pub backoff: Option<BackoffStrategy>,
    pub max_reset_timeout_ms: Option<u64>,
    pub max_recovery_attempts: Option<u32>,
}

impl BreakerConfig {
    /// Effective settings for one target
    #[must_use]
    pub fn settings_for(&self, target: &str) -> BreakerSettings {
        let o = self.overrides.get(target).cloned().unwrap_or_default();
        let reset_timeout = Duration::from_millis(o.reset_timeout_ms.unwrap_or(self.reset_timeout_ms));
        let max_reset_timeout = Duration::from_millis(o.max_reset_timeout_ms.unwrap_or(self.max_reset_timeout_ms))
            .max(reset_timeout);

        BreakerSettings {
            volume_threshold: o.volume_threshold.unwrap_or(self.volume_threshold).max(1),
            error_threshold_percentage: o
                .error_threshold_percentage
                .unwrap_or(self.error_threshold_percentage)
                .clamp(0.0, 100.0),
            reset_timeout,
            rolling_window: Duration::from_millis(self.rolling_window_ms.max(1)),
            rolling_buckets: self.rolling_buckets.max(1),
            backoff: o.backoff.unwrap_or(self.backoff),
            backoff_multiplier: self.backoff_multiplier.max(1.0),
            max_reset_timeout,
            max_recovery_attempts: o.max_recovery_attempts.or(self.max_recovery_attempts),
        }
    }
}

/// Resolved settings owned by a single circuit record
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    pub volume_threshold: u64,
    pub error_threshold_percentage: f64,
    pub reset_timeout: Duration,
    pub rolling_window: Duration,
    pub rolling_buckets: usize,
    pub backoff: BackoffStrategy,
    pub backoff_multiplier: f64,
    pub max_reset_timeout: Duration,
    pub max_recovery_attempts: Option<u32>,
}

impl BreakerSettings {
    /// Reset timeout after `attempts` consecutive failed probes
    #[must_use]
    pub fn reset_timeout_after(&self, attempts: u32) -> Duration {
        let base = self.reset_timeout.as_millis() as f64;
        let millis = match self.backoff {
            BackoffStrategy::None => base,
            BackoffStrategy::Linear => base * f64::from(attempts.saturating_add(1)),
            BackoffStrategy::Exponential => base * self.backoff_multiplier.powi(attempts.min(64) as i32),
        };
        let capped = millis.min(self.max_reset_timeout.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}
