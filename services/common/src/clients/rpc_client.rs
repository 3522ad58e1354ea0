//! RPC client over the broker request channel
//!
//! Each call resolves its deadline from the [`TimeoutResolver`], retries
//! transient broker errors with doubling backoff inside that deadline, and
//! runs under the target's circuit breaker so the whole attempt counts as
//! exactly one outcome.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

use crate::broker::{BrokerError, RequestChannel};
use crate::config::ServiceTarget;
use crate::constants::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS, MAX_RETRY_DELAY_MS};
use crate::errors::ServiceError;
use crate::resilience::{CallOutcome, CircuitBreakerEngine};
use crate::timeouts::{OperationKind, TimeoutResolver};

/// Retry behaviour for transient broker errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay_ms: DEFAULT_RETRY_DELAY_MS,
            max_delay_ms: MAX_RETRY_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// Never retry
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: 0,
            max_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The overall deadline ran out, retries included
    #[error("Deadline of {deadline_ms}ms exceeded calling {exchange}/{routing_key}")]
    DeadlineExceeded {
        exchange: String,
        routing_key: String,
        deadline_ms: u64,
    },
}

impl RpcError {
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::DeadlineExceeded { .. } | Self::Broker(BrokerError::Timeout { .. })
        )
    }
}

impl From<RpcError> for ServiceError {
    fn from(error: RpcError) -> Self {
        match error {
            RpcError::Broker(e) => e.into(),
            e @ RpcError::DeadlineExceeded { .. } => Self::Timeout(e.to_string()),
        }
    }
}

/// Client for broker RPC with deadlines, retries and circuit breaking
#[derive(Clone)]
pub struct RpcClient {
    channel: Arc<dyn RequestChannel>,
    breakers: Arc<CircuitBreakerEngine>,
    timeouts: Arc<TimeoutResolver>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    pub fn new(
        channel: Arc<dyn RequestChannel>,
        breakers: Arc<CircuitBreakerEngine>,
        timeouts: Arc<TimeoutResolver>,
    ) -> Self {
        Self {
            channel,
            breakers,
            timeouts,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerEngine> {
        &self.breakers
    }

    #[must_use]
    pub fn timeouts(&self) -> &Arc<TimeoutResolver> {
        &self.timeouts
    }

    /// Call `<target>.<operation>` on the target's exchange
    pub async fn request(
        &self,
        target: &ServiceTarget,
        operation: &str,
        payload: Value,
    ) -> CallOutcome<Value, RpcError> {
        let routing_key = target.routing_key(operation);
        self.call(target, OperationKind::RpcCall, &routing_key, payload)
            .await
    }

    /// Send the target's health probe
    pub async fn health_check(&self, target: &ServiceTarget) -> CallOutcome<Value, RpcError> {
        let payload = json!({
            "type": "health_check",
            "timestamp": chrono::Utc::now(),
        });
        self.call(target, OperationKind::HealthCheck, &target.health_key(), payload)
            .await
    }

    /// Send one request under the target's breaker and resolved deadline
    pub async fn call(
        &self,
        target: &ServiceTarget,
        operation: OperationKind,
        routing_key: &str,
        payload: Value,
    ) -> CallOutcome<Value, RpcError> {
        let deadline = self.timeouts.resolve(&target.name, operation);
        let exchange = target.exchange.as_str();

        self.breakers
            .execute(&target.name, || async move {
                match timeout(deadline, self.send_within(exchange, routing_key, payload, deadline)).await {
                    Ok(result) => result,
                    Err(_) => Err(RpcError::DeadlineExceeded {
                        exchange: exchange.to_string(),
                        routing_key: routing_key.to_string(),
                        deadline_ms: duration_ms(deadline),
                    }),
                }
            })
            .await
    }

    async fn send_within(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Value,
        deadline: Duration,
    ) -> Result<Value, RpcError> {
        let started = Instant::now();
        let max_delay = Duration::from_millis(self.retry.max_delay_ms);
        let mut delay = Duration::from_millis(self.retry.initial_delay_ms);
        let mut attempt = 0u32;

        loop {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(RpcError::DeadlineExceeded {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    deadline_ms: duration_ms(deadline),
                });
            }

            let error = match self
                .channel
                .send(exchange, routing_key, payload.clone(), remaining)
                .await
            {
                Ok(reply) => return Ok(reply),
                Err(e) => e,
            };

            if !error.is_transient() || attempt >= self.retry.max_retries {
                return Err(error.into());
            }

            // Retrying would overrun the deadline
            if delay >= deadline.saturating_sub(started.elapsed()) {
                return Err(error.into());
            }

            attempt += 1;
            debug!(
                exchange = %exchange,
                routing_key = %routing_key,
                attempt,
                delay_ms = duration_ms(delay),
                error = %error,
                "Retrying broker request"
            );
            sleep(delay).await;
            delay = (delay * 2).min(max_delay);
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
