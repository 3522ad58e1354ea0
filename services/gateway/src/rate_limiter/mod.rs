//! Fixed-window rate limiting with burst allowance and blocking
//!
//! Every decision is a single atomic evaluation against a [`RateLimitStore`]:
//! the Redis store runs it as a Lua script so concurrent gateway processes
//! share one limit, the memory store runs it under one lock.
//!
//! Store failures fail open: the request is admitted and a warning logged.

mod memory;
mod script;

pub use memory::MemoryRateLimitStore;
pub use script::RedisRateLimitStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Rate limit parameters for one check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitOptions {
    /// Window length in seconds
    pub window_seconds: u64,
    /// Requests admitted per window
    pub limit: u64,
    /// Block duration after a rejection, 0 disables blocking
    pub block_seconds: u64,
    /// Cost of one request
    pub points: u64,
    /// Extra allowance on top of `limit`
    pub burst: u64,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            limit: 100,
            block_seconds: 0,
            points: 1,
            burst: 0,
        }
    }
}

impl RateLimitOptions {
    #[must_use]
    pub const fn effective_limit(&self) -> u64 {
        self.limit.saturating_add(self.burst)
    }

    /// Reject option sets that can never admit anything sensible
    pub fn validate(&self) -> Result<(), RateLimitError> {
        if self.window_seconds == 0 {
            return Err(RateLimitError::InvalidOptions(
                "window_seconds must be positive".to_string(),
            ));
        }
        if self.points == 0 {
            return Err(RateLimitError::InvalidOptions(
                "points must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Hits counted in the current window, including this one when it was evaluated
    pub total_hits: u64,
    pub remaining: u64,
    /// Seconds until the window (or block) ends
    pub reset_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl RateLimitResult {
    /// Result used when the store cannot be consulted
    #[must_use]
    pub const fn fail_open(options: &RateLimitOptions, reset_seconds: u64) -> Self {
        Self {
            allowed: true,
            total_hits: 0,
            remaining: options.effective_limit(),
            reset_seconds,
            retry_after_seconds: None,
        }
    }
}

/// Keys and arguments of one atomic evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRequest {
    pub window_key: String,
    pub block_key: String,
    pub points: u64,
    pub effective_limit: u64,
    pub window_seconds: u64,
    pub block_seconds: u64,
    /// Seconds left in the current window
    pub reset_seconds: u64,
    /// Caller's clock in unix seconds
    pub now_secs: u64,
}

impl WindowRequest {
    #[must_use]
    pub fn new(prefix: &str, client_key: &str, options: &RateLimitOptions, now_secs: u64) -> Self {
        let window = options.window_seconds.max(1);
        let window_start = now_secs - now_secs % window;

        Self {
            window_key: format!("{prefix}:{client_key}:{window_start}"),
            block_key: format!("{prefix}:{client_key}:block"),
            points: options.points.max(1),
            effective_limit: options.effective_limit(),
            window_seconds: window,
            block_seconds: options.block_seconds,
            reset_seconds: window_start + window - now_secs,
            now_secs,
        }
    }
}

/// Rate limiting errors
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("Unexpected store reply: {0}")]
    MalformedReply(String),

    #[error("Invalid rate limit options: {0}")]
    InvalidOptions(String),
}

/// Atomic check-and-count against a shared store
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn evaluate(&self, request: &WindowRequest) -> Result<RateLimitResult, RateLimitError>;

    fn name(&self) -> &'static str;
}

/// Rate limiter fronting a store
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    key_prefix: String,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store.name())
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
        }
    }

    /// In-process limiter, state local to this process
    #[must_use]
    pub fn in_memory(key_prefix: impl Into<String>) -> Self {
        Self::new(Arc::new(MemoryRateLimitStore::new()), key_prefix)
    }

    #[must_use]
    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Check and count one request for `client_key` at the current time
    pub async fn check(&self, client_key: &str, options: &RateLimitOptions) -> RateLimitResult {
        let now_secs = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
        self.check_at(client_key, options, now_secs).await
    }

    /// Check and count one request with an explicit clock
    pub async fn check_at(
        &self,
        client_key: &str,
        options: &RateLimitOptions,
        now_secs: u64,
    ) -> RateLimitResult {
        let request = WindowRequest::new(&self.key_prefix, client_key, options, now_secs);

        match self.store.evaluate(&request).await {
            Ok(result) => {
                if !result.allowed {
                    debug!(
                        client = %client_key,
                        total_hits = result.total_hits,
                        retry_after = ?result.retry_after_seconds,
                        "Rate limit exceeded"
                    );
                }
                result
            }
            Err(e) => {
                warn!(
                    client = %client_key,
                    store = self.store.name(),
                    error = %e,
                    "Rate limit store unavailable, admitting request"
                );
                #[cfg(feature = "monitoring")]
                metrics::counter!("api_gateway_rate_limit_store_errors_total").increment(1);
                RateLimitResult::fail_open(options, request.reset_seconds)
            }
        }
    }
}
