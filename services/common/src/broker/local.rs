//! In-process broker
//!
//! Exchanges route into queues through bindings. Queues buffer published
//! events for consumers, and a queue with a registered [`RequestHandler`]
//! answers request/response traffic. Expired, overflowing and rejected
//! messages are dead-lettered when the queue names a dead-letter exchange.

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::router::binding_matches;
use super::{
    BrokerError, BrokerMetrics, BrokerResult, Envelope, EventSink, RequestChannel, RequestHandler,
};
use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec, TopologyChannel};

/// Header naming why a message was dead-lettered
pub const DEATH_REASON_HEADER: &str = "x-death-reason";
/// Header naming the queue a dead letter came from
pub const DEATH_QUEUE_HEADER: &str = "x-death-queue";

struct ExchangeState {
    spec: ExchangeSpec,
    /// (queue, binding key)
    bindings: Vec<(String, String)>,
}

struct QueueState {
    spec: QueueSpec,
    messages: VecDeque<Envelope>,
    responder: Option<Arc<dyn RequestHandler>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: FxHashMap<String, ExchangeState>,
    queues: FxHashMap<String, QueueState>,
}

impl BrokerState {
    /// Queues a message for `exchange`/`routing_key` is delivered to
    ///
    /// The unnamed exchange routes straight to the queue named by the key.
    fn route(&self, exchange: &str, routing_key: &str) -> BrokerResult<Vec<String>> {
        if exchange.is_empty() {
            return Ok(if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            });
        }

        let state = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;

        let mut queues: Vec<String> = state
            .bindings
            .iter()
            .filter(|(_, key)| binding_matches(state.spec.kind, key, routing_key))
            .map(|(queue, _)| queue.clone())
            .collect();
        queues.sort();
        queues.dedup();
        Ok(queues)
    }

    fn enqueue(
        &mut self,
        queue: &str,
        envelope: Envelope,
        metrics: &BrokerMetrics,
        allow_dead_letter: bool,
    ) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        state.messages.push_back(envelope);

        let overflow = match state.spec.max_length {
            Some(max) if state.messages.len() > max => state.messages.pop_front(),
            _ => None,
        };

        if let Some(dropped) = overflow {
            if allow_dead_letter {
                self.dead_letter(queue, dropped, "maxlen", metrics);
            } else {
                warn!(queue = %queue, "Dead-letter queue overflow, dropping oldest message");
            }
        }
    }

    fn dead_letter(&mut self, queue: &str, mut envelope: Envelope, reason: &str, metrics: &BrokerMetrics) {
        let Some(spec) = self.queues.get(queue).map(|state| state.spec.clone()) else {
            return;
        };
        metrics.record_dead_letter(queue);

        let Some(dlx) = spec.dead_letter_exchange else {
            debug!(queue = %queue, reason = %reason, "Message discarded, no dead-letter exchange");
            return;
        };

        let routing_key = spec
            .dead_letter_routing_key
            .unwrap_or_else(|| envelope.routing_key.clone());
        envelope
            .metadata
            .headers
            .insert(DEATH_REASON_HEADER.to_string(), reason.to_string());
        envelope
            .metadata
            .headers
            .insert(DEATH_QUEUE_HEADER.to_string(), queue.to_string());
        envelope.exchange.clone_from(&dlx);
        envelope.routing_key.clone_from(&routing_key);

        match self.route(&dlx, &routing_key) {
            Ok(targets) if !targets.is_empty() => {
                debug!(
                    queue = %queue,
                    dead_letter_exchange = %dlx,
                    reason = %reason,
                    "Message dead-lettered"
                );
                for target in targets {
                    self.enqueue(&target, envelope.clone(), metrics, false);
                }
            }
            Ok(_) => {
                metrics.record_unroutable(&dlx);
                warn!(queue = %queue, dead_letter_exchange = %dlx, "Dead letter unroutable");
            }
            Err(e) => warn!(queue = %queue, error = %e, "Dead-letter exchange missing"),
        }
    }
}

/// In-process broker implementing the request, event and topology contracts
pub struct LocalBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
    metrics: Arc<BrokerMetrics>,
    source: String,
}

impl std::fmt::Debug for LocalBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LocalBroker")
            .field("source", &self.source)
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .finish()
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new("local")
    }
}

impl LocalBroker {
    /// Create a broker; `source` is stamped on every envelope it creates
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
            metrics: Arc::new(BrokerMetrics::new()),
            source: source.into(),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<BrokerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Attach the request handler serving a queue
    pub fn register_responder(&self, queue: &str, handler: Arc<dyn RequestHandler>) -> BrokerResult<()> {
        let mut state = self.state.lock();
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        debug!(queue = %queue, handler = handler.name(), "Responder registered");
        queue_state.responder = Some(handler);
        Ok(())
    }

    pub fn remove_responder(&self, queue: &str) -> BrokerResult<()> {
        let mut state = self.state.lock();
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        queue_state.responder = None;
        Ok(())
    }

    #[must_use]
    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    #[must_use]
    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    /// Messages currently buffered on a queue
    pub fn queue_depth(&self, queue: &str) -> BrokerResult<usize> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|state| state.messages.len())
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))
    }

    /// Pop the next live message, dead-lettering any that expired
    pub fn try_consume(&self, queue: &str) -> BrokerResult<Option<Envelope>> {
        let mut state = self.state.lock();
        loop {
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
            let queue_ttl = queue_state.spec.message_ttl_ms;

            let Some(envelope) = queue_state.messages.pop_front() else {
                return Ok(None);
            };

            let ttl = envelope.metadata.ttl_ms.or(queue_ttl);
            match ttl {
                Some(ttl_ms) if envelope.age_ms() > ttl_ms => {
                    state.dead_letter(queue, envelope, "expired", &self.metrics);
                }
                _ => return Ok(Some(envelope)),
            }
        }
    }

    /// Wait up to `wait` for the next message on a queue
    pub async fn consume(&self, queue: &str, wait: Duration) -> BrokerResult<Option<Envelope>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(envelope) = self.try_consume(queue)? {
                return Ok(Some(envelope));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn dead_letter_request(&self, queue: &str, envelope: Envelope, reason: &str) {
        self.state
            .lock()
            .dead_letter(queue, envelope, reason, &self.metrics);
        self.notify.notify_waiters();
    }
}

impl EventSink for LocalBroker {
    fn publish(&self, exchange: &str, routing_key: &str, payload: Value) -> BrokerResult<()> {
        let mut envelope = Envelope::new(exchange, routing_key, payload);
        envelope.metadata.source.clone_from(&self.source);

        {
            let mut state = self.state.lock();
            let queues = state.route(exchange, routing_key)?;

            if queues.is_empty() {
                self.metrics.record_unroutable(exchange);
                debug!(exchange = %exchange, routing_key = %routing_key, "Event unroutable, dropped");
                return Ok(());
            }

            for queue in &queues {
                state.enqueue(queue, envelope.clone(), &self.metrics, true);
            }
        }

        self.metrics.record_publish(exchange);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl RequestChannel for LocalBroker {
    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Value,
        timeout: Duration,
    ) -> BrokerResult<Value> {
        let (queue, handler) = {
            let state = self.state.lock();
            let queues = state.route(exchange, routing_key)?;

            if queues.is_empty() {
                self.metrics.record_unroutable(exchange);
                return Err(BrokerError::NoRoute {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                });
            }

            let responder = queues.iter().find_map(|queue| {
                state
                    .queues
                    .get(queue)
                    .and_then(|q| q.responder.clone())
                    .map(|handler| (queue.clone(), handler))
            });

            match responder {
                Some(found) => found,
                None => return Err(BrokerError::NoConsumer(queues[0].clone())),
            }
        };

        let mut envelope = Envelope::new(exchange, routing_key, payload);
        envelope.metadata.source.clone_from(&self.source);
        envelope.metadata.correlation_id = Some(envelope.metadata.message_id.clone());
        envelope.metadata.ttl_ms = u64::try_from(timeout.as_millis()).ok();

        match tokio::time::timeout(timeout, handler.handle(envelope.clone())).await {
            Ok(Ok(reply)) => {
                self.metrics.record_reply(exchange);
                Ok(reply)
            }
            Ok(Err(e)) => {
                warn!(
                    queue = %queue,
                    handler = handler.name(),
                    error = %e,
                    "Request handler failed"
                );
                self.dead_letter_request(&queue, envelope, "rejected");
                Err(BrokerError::Remote(e.to_string()))
            }
            Err(_) => {
                self.metrics.record_timeout(exchange);
                Err(BrokerError::Timeout {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }
}

#[async_trait]
impl TopologyChannel for LocalBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BrokerResult<()> {
        let mut state = self.state.lock();
        if let Some(existing) = state.exchanges.get(&spec.name) {
            return if existing.spec == *spec {
                Ok(())
            } else {
                Err(BrokerError::PreconditionFailed(format!(
                    "exchange '{}' already declared with different arguments",
                    spec.name
                )))
            };
        }

        state.exchanges.insert(
            spec.name.clone(),
            ExchangeState {
                spec: spec.clone(),
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BrokerResult<()> {
        let mut state = self.state.lock();
        if let Some(existing) = state.queues.get(&spec.name) {
            return if existing.spec == *spec {
                Ok(())
            } else {
                Err(BrokerError::PreconditionFailed(format!(
                    "queue '{}' already declared with different arguments",
                    spec.name
                )))
            };
        }

        state.queues.insert(
            spec.name.clone(),
            QueueState {
                spec: spec.clone(),
                messages: VecDeque::new(),
                responder: None,
            },
        );
        Ok(())
    }

    async fn bind(&self, spec: &BindingSpec) -> BrokerResult<()> {
        let mut state = self.state.lock();
        if !state.queues.contains_key(&spec.queue) {
            return Err(BrokerError::QueueNotFound(spec.queue.clone()));
        }

        let exchange = state
            .exchanges
            .get_mut(&spec.exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(spec.exchange.clone()))?;

        let binding = (spec.queue.clone(), spec.routing_key.clone());
        if !exchange.bindings.contains(&binding) {
            exchange.bindings.push(binding);
        }
        Ok(())
    }
}
