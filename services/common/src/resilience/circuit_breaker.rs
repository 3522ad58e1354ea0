//! Per-target circuit breaker engine
//!
//! Every target gets its own [`CircuitRecord`] behind a mutex, created on
//! first use and never removed. Calls are admitted or rejected under the
//! lock, the downstream future runs without it, and the outcome is folded
//! back in under the lock again. Records carry a generation that an
//! administrative reset bumps; outcomes from an older generation are
//! discarded, so a reset always wins over an in-flight half-open probe.

#![allow(clippy::cast_possible_truncation)]

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::rolling_window::{Outcome, RollingWindow, WindowCounts};
use super::settings::{BreakerConfig, BreakerSettings};
use crate::broker::EventSink;
use crate::constants::PLATFORM_EVENTS_EXCHANGE;

/// Breaker state of a single target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a wrapped call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallResult<T, E> {
    Success(T),
    Failure(E),
    /// Refused by an open circuit, target not invoked
    Rejected,
    /// Refused by an open circuit, value synthesized by the fallback
    Fallback(T),
}

/// Result of [`CircuitBreakerEngine::execute`], never an error itself
#[derive(Debug, Clone)]
pub struct CallOutcome<T, E> {
    pub target: String,
    pub result: CallResult<T, E>,
    pub elapsed: Duration,
    /// Circuit state once the call was accounted for
    pub state: CircuitState,
    /// Whether this call was the half-open probe
    pub probe: bool,
}

impl<T, E> CallOutcome<T, E> {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.result, CallResult::Success(_))
    }

    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self.result, CallResult::Rejected | CallResult::Fallback(_))
    }

    #[must_use]
    pub const fn is_fallback(&self) -> bool {
        matches!(self.result, CallResult::Fallback(_))
    }

    /// The produced value, real or synthesized
    pub fn into_value(self) -> Option<T> {
        match self.result {
            CallResult::Success(value) | CallResult::Fallback(value) => Some(value),
            CallResult::Failure(_) | CallResult::Rejected => None,
        }
    }
}

/// Point-in-time view of a circuit record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub target: String,
    pub state: CircuitState,
    pub counts: WindowCounts,
    pub failure_percentage: f64,
    pub last_state_change: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Time spent open so far
    pub open_for_ms: Option<u64>,
    /// Time until the next probe is admitted
    pub next_probe_in_ms: Option<u64>,
    pub reset_timeout_ms: u64,
    pub recovery_attempts: u32,
    /// Open until an administrative reset
    pub locked: bool,
}

enum Admission {
    Call { generation: u64, probe: bool },
    Reject,
}

struct Transition {
    target: String,
    from: CircuitState,
    to: CircuitState,
    reason: String,
}

struct CircuitRecord {
    target: String,
    settings: BreakerSettings,
    state: CircuitState,
    window: RollingWindow,
    opened_at: Option<Instant>,
    current_reset_timeout: Duration,
    last_state_change: DateTime<Utc>,
    last_error: Option<String>,
    recovery_attempts: u32,
    locked: bool,
    probe_in_flight: bool,
    generation: u64,
}

impl CircuitRecord {
    fn new(target: &str, settings: BreakerSettings, now: Instant) -> Self {
        Self {
            target: target.to_string(),
            window: RollingWindow::new(settings.rolling_window, settings.rolling_buckets, now),
            current_reset_timeout: settings.reset_timeout,
            settings,
            state: CircuitState::Closed,
            opened_at: None,
            last_state_change: Utc::now(),
            last_error: None,
            recovery_attempts: 0,
            locked: false,
            probe_in_flight: false,
            generation: 0,
        }
    }

    fn transition(&mut self, to: CircuitState, reason: impl Into<String>) -> Option<Transition> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        self.last_state_change = Utc::now();
        Some(Transition {
            target: self.target.clone(),
            from,
            to,
            reason: reason.into(),
        })
    }

    fn probe_due(&self, now: Instant) -> bool {
        !self.locked
            && self
                .opened_at
                .is_none_or(|opened| now.saturating_duration_since(opened) >= self.current_reset_timeout)
    }

    fn call_permitted(&self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.probe_due(now),
            CircuitState::HalfOpen => !self.probe_in_flight,
        }
    }

    fn admit(&mut self, now: Instant) -> (Admission, Option<Transition>) {
        match self.state {
            CircuitState::Closed => (
                Admission::Call {
                    generation: self.generation,
                    probe: false,
                },
                None,
            ),
            CircuitState::Open if self.probe_due(now) => {
                self.probe_in_flight = true;
                let transition = self.transition(CircuitState::HalfOpen, "reset timeout elapsed");
                (
                    Admission::Call {
                        generation: self.generation,
                        probe: true,
                    },
                    transition,
                )
            }
            CircuitState::HalfOpen if !self.probe_in_flight => {
                self.probe_in_flight = true;
                (
                    Admission::Call {
                        generation: self.generation,
                        probe: true,
                    },
                    None,
                )
            }
            CircuitState::Open | CircuitState::HalfOpen => {
                self.window.record(Outcome::Rejection, now);
                (Admission::Reject, None)
            }
        }
    }

    fn complete(
        &mut self,
        generation: u64,
        probe: bool,
        outcome: Result<(), String>,
        now: Instant,
    ) -> Option<Transition> {
        if generation != self.generation {
            debug!(service = %self.target, "Discarding outcome from before reset");
            return None;
        }

        let failed = outcome.is_err();
        if let Err(error) = outcome {
            self.last_error = Some(error);
        }
        self.window
            .record(if failed { Outcome::Failure } else { Outcome::Success }, now);

        if probe {
            self.probe_in_flight = false;
            return if failed {
                self.reopen(now)
            } else {
                self.close(now, "probe succeeded")
            };
        }

        if failed && self.state == CircuitState::Closed {
            let counts = self.window.totals(now);
            if counts.requests >= self.settings.volume_threshold
                && counts.failure_percentage() >= self.settings.error_threshold_percentage
            {
                self.recovery_attempts = 0;
                self.current_reset_timeout = self.settings.reset_timeout;
                self.opened_at = Some(now);
                return self.transition(
                    CircuitState::Open,
                    format!(
                        "{:.1}% of {} requests failed",
                        counts.failure_percentage(),
                        counts.requests
                    ),
                );
            }
        }
        None
    }

    fn reopen(&mut self, now: Instant) -> Option<Transition> {
        self.recovery_attempts = self.recovery_attempts.saturating_add(1);
        self.current_reset_timeout = self.settings.reset_timeout_after(self.recovery_attempts);
        self.opened_at = Some(now);

        let mut reason = format!(
            "probe failed, retry in {}ms",
            self.current_reset_timeout.as_millis()
        );
        if let Some(max) = self.settings.max_recovery_attempts {
            if self.recovery_attempts >= max {
                self.locked = true;
                reason = format!("probe failed {max} times, locked until reset");
            }
        }
        self.transition(CircuitState::Open, reason)
    }

    fn close(&mut self, now: Instant, reason: &str) -> Option<Transition> {
        self.window.reset(now);
        self.opened_at = None;
        self.recovery_attempts = 0;
        self.locked = false;
        self.current_reset_timeout = self.settings.reset_timeout;
        self.transition(CircuitState::Closed, reason)
    }

    fn reset(&mut self, now: Instant) -> Option<Transition> {
        self.generation += 1;
        self.probe_in_flight = false;
        self.last_error = None;
        self.close(now, "administrative reset")
    }

    fn snapshot(&self, now: Instant) -> CircuitSnapshot {
        let counts = self.window.totals(now);
        let open_for = match self.state {
            CircuitState::Closed => None,
            _ => self.opened_at.map(|opened| now.saturating_duration_since(opened)),
        };
        let next_probe_in = match (self.state, open_for) {
            (CircuitState::Open, Some(open_for)) if !self.locked => {
                Some(self.current_reset_timeout.saturating_sub(open_for))
            }
            _ => None,
        };

        CircuitSnapshot {
            target: self.target.clone(),
            state: self.state,
            failure_percentage: counts.failure_percentage(),
            counts,
            last_state_change: self.last_state_change,
            last_error: self.last_error.clone(),
            open_for_ms: open_for.map(|d| d.as_millis() as u64),
            next_probe_in_ms: next_probe_in.map(|d| d.as_millis() as u64),
            reset_timeout_ms: self.current_reset_timeout.as_millis() as u64,
            recovery_attempts: self.recovery_attempts,
            locked: self.locked,
        }
    }
}

/// Accounts for an admitted call whose future is dropped before it completes
struct InFlight<'a> {
    engine: &'a CircuitBreakerEngine,
    record: Arc<Mutex<CircuitRecord>>,
    generation: u64,
    probe: bool,
    armed: bool,
}

impl InFlight<'_> {
    fn finish(mut self, outcome: Result<(), String>) -> CircuitState {
        self.armed = false;
        let (transition, state) = {
            let mut record = self.record.lock();
            let transition = record.complete(self.generation, self.probe, outcome, Instant::now());
            (transition, record.state)
        };
        self.engine.announce(transition);
        state
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let transition = self.record.lock().complete(
            self.generation,
            self.probe,
            Err("call cancelled".to_string()),
            Instant::now(),
        );
        self.engine.announce(transition);
    }
}

/// Circuit breakers for every downstream target, owned by one instance
pub struct CircuitBreakerEngine {
    config: BreakerConfig,
    records: DashMap<String, Arc<Mutex<CircuitRecord>>>,
    events: Option<Arc<dyn EventSink>>,
}

impl fmt::Debug for CircuitBreakerEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerEngine")
            .field("targets", &self.records.len())
            .field("events", &self.events.is_some())
            .finish()
    }
}

impl Default for CircuitBreakerEngine {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl CircuitBreakerEngine {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
            events: None,
        }
    }

    /// Publish state transitions to `platform.events`
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn record(&self, target: &str) -> Arc<Mutex<CircuitRecord>> {
        if let Some(record) = self.records.get(target) {
            return Arc::clone(record.value());
        }
        let entry = self.records.entry(target.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(CircuitRecord::new(
                target,
                self.config.settings_for(target),
                Instant::now(),
            )))
        });
        Arc::clone(entry.value())
    }

    /// Run `call` under the target's breaker
    pub async fn execute<T, E, F, Fut>(&self, target: &str, call: F) -> CallOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.run(target, call, None::<fn() -> T>).await
    }

    /// Like [`Self::execute`], answering rejected calls from `fallback`
    pub async fn execute_with_fallback<T, E, F, Fut, FB>(
        &self,
        target: &str,
        call: F,
        fallback: FB,
    ) -> CallOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        FB: FnOnce() -> T,
    {
        self.run(target, call, Some(fallback)).await
    }

    async fn run<T, E, F, Fut, FB>(
        &self,
        target: &str,
        call: F,
        fallback: Option<FB>,
    ) -> CallOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        FB: FnOnce() -> T,
    {
        let started = Instant::now();
        let record = self.record(target);

        let (admission, transition, state) = {
            let mut guard = record.lock();
            let (admission, transition) = guard.admit(started);
            (admission, transition, guard.state)
        };
        self.announce(transition);

        let (generation, probe) = match admission {
            Admission::Call { generation, probe } => (generation, probe),
            Admission::Reject => {
                debug!(service = %target, state = %state, "Call rejected by open circuit");
                #[cfg(feature = "monitoring")]
                metrics::counter!("circuit_breaker_rejections_total", "target" => target.to_string())
                    .increment(1);

                let result = match fallback {
                    Some(fallback) => CallResult::Fallback(fallback()),
                    None => CallResult::Rejected,
                };
                return CallOutcome {
                    target: target.to_string(),
                    result,
                    elapsed: started.elapsed(),
                    state,
                    probe: false,
                };
            }
        };

        let in_flight = InFlight {
            engine: self,
            record,
            generation,
            probe,
            armed: true,
        };

        let (result, state) = match call().await {
            Ok(value) => (CallResult::Success(value), in_flight.finish(Ok(()))),
            Err(error) => {
                let state = in_flight.finish(Err(error.to_string()));
                (CallResult::Failure(error), state)
            }
        };

        CallOutcome {
            target: target.to_string(),
            result,
            elapsed: started.elapsed(),
            state,
            probe,
        }
    }

    /// Snapshot of a target, creating its record on first use
    #[must_use]
    pub fn get_state(&self, target: &str) -> CircuitSnapshot {
        self.record(target).lock().snapshot(Instant::now())
    }

    /// Current state, `Closed` for targets never called
    #[must_use]
    pub fn state_of(&self, target: &str) -> CircuitState {
        self.records
            .get(target)
            .map_or(CircuitState::Closed, |record| record.lock().state)
    }

    /// Whether the next call to `target` would be invoked, without admitting it
    #[must_use]
    pub fn is_call_permitted(&self, target: &str) -> bool {
        self.records
            .get(target)
            .is_none_or(|record| record.lock().call_permitted(Instant::now()))
    }

    /// Force a target closed with zeroed counters
    ///
    /// Returns how many records were reset (0 if the target was never called).
    pub fn reset(&self, target: &str) -> usize {
        let Some(record) = self.records.get(target).map(|r| Arc::clone(r.value())) else {
            return 0;
        };
        let transition = record.lock().reset(Instant::now());
        info!(service = %target, "Circuit breaker reset");
        self.announce(transition);
        1
    }

    #[must_use]
    pub fn get_all_states(&self) -> BTreeMap<String, CircuitSnapshot> {
        let records: Vec<(String, Arc<Mutex<CircuitRecord>>)> = self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let now = Instant::now();
        records
            .into_iter()
            .map(|(target, record)| {
                let snapshot = record.lock().snapshot(now);
                (target, snapshot)
            })
            .collect()
    }

    fn announce(&self, transition: Option<Transition>) {
        let Some(transition) = transition else {
            return;
        };

        match transition.to {
            CircuitState::Open => warn!(
                service = %transition.target,
                from = %transition.from,
                reason = %transition.reason,
                "Circuit opened"
            ),
            CircuitState::HalfOpen => info!(
                service = %transition.target,
                from = %transition.from,
                "Circuit half-open, probing"
            ),
            CircuitState::Closed => info!(
                service = %transition.target,
                from = %transition.from,
                reason = %transition.reason,
                "Circuit closed"
            ),
        }

        #[cfg(feature = "monitoring")]
        metrics::counter!(
            "circuit_breaker_transitions_total",
            "target" => transition.target.clone(),
            "state" => transition.to.as_str()
        )
        .increment(1);

        let Some(sink) = &self.events else {
            return;
        };
        let routing_key = format!("circuit.{}", transition.to.as_str());
        let payload = json!({
            "target": transition.target,
            "from": transition.from.as_str(),
            "to": transition.to.as_str(),
            "reason": transition.reason,
            "timestamp": Utc::now(),
        });
        if let Err(e) = sink.publish(PLATFORM_EVENTS_EXCHANGE, &routing_key, payload) {
            warn!(error = %e, routing_key = %routing_key, "Failed to publish circuit event");
        }
    }
}
