//! Broker topology declaration
//!
//! Exchanges, queues and bindings the RPC client and health aggregator rely
//! on are declared once at startup, before any traffic is accepted.
//! Declarations are idempotent. A failure stops the run and reports exactly
//! which declarations were already applied.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::broker::{BrokerError, BrokerResult};
use crate::config::ServiceTarget;
use crate::constants::{
    DEFAULT_DEAD_LETTER_EXCHANGE, DEFAULT_DEAD_LETTER_QUEUE, DEFAULT_QUEUE_MAX_LENGTH,
    DEFAULT_QUEUE_MESSAGE_TTL_MS, GATEWAY_EVENTS_QUEUE, PLATFORM_EVENTS_EXCHANGE,
};

/// Exchange routing behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    #[serde(default = "default_true")]
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub durable: bool,
    /// Per-message TTL; expired messages are dead-lettered
    #[serde(default)]
    pub message_ttl_ms: Option<u64>,
    /// Oldest message is dead-lettered once this is exceeded
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub dead_letter_exchange: Option<String>,
    /// Routing key for dead letters; the original key is kept when unset
    #[serde(default)]
    pub dead_letter_routing_key: Option<String>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            message_ttl_ms: None,
            max_length: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }

    #[must_use]
    pub const fn with_message_ttl(mut self, ttl_ms: u64) -> Self {
        self.message_ttl_ms = Some(ttl_ms);
        self
    }

    #[must_use]
    pub const fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    #[must_use]
    pub fn with_dead_letter(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindingSpec {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl BindingSpec {
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Full topology applied in one batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<BindingSpec>,
}

impl TopologyConfig {
    /// Default topology for a set of downstream targets
    ///
    /// One request queue per target on its RPC exchange, a shared
    /// dead-letter route, and the platform events exchange.
    #[must_use]
    pub fn for_targets(targets: &[ServiceTarget]) -> Self {
        let mut config = Self::default();

        config.exchanges.push(ExchangeSpec::new(
            DEFAULT_DEAD_LETTER_EXCHANGE,
            ExchangeKind::Fanout,
        ));
        config
            .queues
            .push(QueueSpec::new(DEFAULT_DEAD_LETTER_QUEUE).with_max_length(DEFAULT_QUEUE_MAX_LENGTH));
        config.bindings.push(BindingSpec::new(
            DEFAULT_DEAD_LETTER_QUEUE,
            DEFAULT_DEAD_LETTER_EXCHANGE,
            "#",
        ));

        for target in targets {
            if !config.exchanges.iter().any(|e| e.name == target.exchange) {
                config
                    .exchanges
                    .push(ExchangeSpec::new(target.exchange.clone(), ExchangeKind::Topic));
            }

            let queue = target.request_queue();
            config.queues.push(
                QueueSpec::new(queue.clone())
                    .with_message_ttl(DEFAULT_QUEUE_MESSAGE_TTL_MS)
                    .with_max_length(DEFAULT_QUEUE_MAX_LENGTH)
                    .with_dead_letter(DEFAULT_DEAD_LETTER_EXCHANGE),
            );
            config.bindings.push(BindingSpec::new(
                queue,
                target.exchange.clone(),
                format!("{}.#", target.name),
            ));
        }

        config
            .exchanges
            .push(ExchangeSpec::new(PLATFORM_EVENTS_EXCHANGE, ExchangeKind::Topic));
        config.queues.push(
            QueueSpec::new(GATEWAY_EVENTS_QUEUE)
                .with_message_ttl(DEFAULT_QUEUE_MESSAGE_TTL_MS)
                .with_max_length(DEFAULT_QUEUE_MAX_LENGTH),
        );
        config.bindings.push(BindingSpec::new(
            GATEWAY_EVENTS_QUEUE,
            PLATFORM_EVENTS_EXCHANGE,
            "circuit.#",
        ));

        config
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.exchanges.len() + self.queues.len() + self.bindings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Broker-side declaration primitives
#[async_trait]
pub trait TopologyChannel: Send + Sync {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<()>;
    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<()>;
    async fn bind(&self, spec: &BindingSpec) -> BrokerResult<()>;
}

/// A single applied declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Declaration {
    Exchange { name: String },
    Queue { name: String },
    Binding {
        queue: String,
        exchange: String,
        routing_key: String,
    },
}

impl fmt::Display for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exchange { name } => write!(f, "exchange '{name}'"),
            Self::Queue { name } => write!(f, "queue '{name}'"),
            Self::Binding {
                queue,
                exchange,
                routing_key,
            } => write!(f, "binding '{exchange}' -> '{queue}' ({routing_key})"),
        }
    }
}

/// Successful batch application
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopologyReport {
    pub applied: Vec<Declaration>,
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// Setup stopped part-way; `applied` lists what is known to exist
    #[error("topology setup failed at {failed} after {} successful declarations: {source}", .applied.len())]
    Partial {
        applied: Vec<Declaration>,
        failed: Declaration,
        source: BrokerError,
    },
}

impl TopologyError {
    #[must_use]
    pub fn applied(&self) -> &[Declaration] {
        match self {
            Self::Partial { applied, .. } => applied,
        }
    }
}

/// Declares topology against a broker
#[derive(Clone)]
pub struct TopologyManager {
    channel: Arc<dyn TopologyChannel>,
}

impl fmt::Debug for TopologyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologyManager")
            .field("channel", &"Arc<dyn TopologyChannel>")
            .finish()
    }
}

impl TopologyManager {
    pub fn new(channel: Arc<dyn TopologyChannel>) -> Self {
        Self { channel }
    }

    pub async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<Declaration> {
        self.channel.declare_exchange(spec).await?;
        debug!(exchange = %spec.name, kind = ?spec.kind, "Exchange declared");
        Ok(Declaration::Exchange {
            name: spec.name.clone(),
        })
    }

    pub async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<Declaration> {
        self.channel.declare_queue(spec).await?;
        debug!(
            queue = %spec.name,
            ttl_ms = ?spec.message_ttl_ms,
            max_length = ?spec.max_length,
            dead_letter_exchange = ?spec.dead_letter_exchange,
            "Queue declared"
        );
        Ok(Declaration::Queue {
            name: spec.name.clone(),
        })
    }

    pub async fn bind(&self, spec: &BindingSpec) -> BrokerResult<Declaration> {
        self.channel.bind(spec).await?;
        debug!(
            queue = %spec.queue,
            exchange = %spec.exchange,
            routing_key = %spec.routing_key,
            "Queue bound"
        );
        Ok(Declaration::Binding {
            queue: spec.queue.clone(),
            exchange: spec.exchange.clone(),
            routing_key: spec.routing_key.clone(),
        })
    }

    /// Apply exchanges, then queues, then bindings
    pub async fn apply_topology(&self, config: &TopologyConfig) -> Result<TopologyReport, TopologyError> {
        let mut applied = Vec::with_capacity(config.len());

        for spec in &config.exchanges {
            let attempt = self.declare_exchange(spec).await;
            Self::push_or_fail(&mut applied, attempt, || Declaration::Exchange {
                name: spec.name.clone(),
            })?;
        }

        for spec in &config.queues {
            let attempt = self.declare_queue(spec).await;
            Self::push_or_fail(&mut applied, attempt, || Declaration::Queue {
                name: spec.name.clone(),
            })?;
        }

        for spec in &config.bindings {
            let attempt = self.bind(spec).await;
            Self::push_or_fail(&mut applied, attempt, || Declaration::Binding {
                queue: spec.queue.clone(),
                exchange: spec.exchange.clone(),
                routing_key: spec.routing_key.clone(),
            })?;
        }

        info!(declarations = applied.len(), "Broker topology applied");
        Ok(TopologyReport { applied })
    }

    fn push_or_fail(
        applied: &mut Vec<Declaration>,
        attempt: BrokerResult<Declaration>,
        failed: impl FnOnce() -> Declaration,
    ) -> Result<(), TopologyError> {
        match attempt {
            Ok(declaration) => {
                applied.push(declaration);
                Ok(())
            }
            Err(source) => {
                let failed = failed();
                error!(
                    failed = %failed,
                    applied = applied.len(),
                    error = %source,
                    "Topology declaration failed"
                );
                Err(TopologyError::Partial {
                    applied: std::mem::take(applied),
                    failed,
                    source,
                })
            }
        }
    }
}
