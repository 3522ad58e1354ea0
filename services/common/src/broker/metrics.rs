//! Per-exchange counters for the in-process broker

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Broker metrics collector
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    /// Events published by exchange
    published: RwLock<FxHashMap<String, AtomicU64>>,
    /// Requests answered by exchange
    replied: RwLock<FxHashMap<String, AtomicU64>>,
    /// Requests that timed out by exchange
    timeouts: RwLock<FxHashMap<String, AtomicU64>>,
    /// Messages without a matching binding by exchange
    unroutable: RwLock<FxHashMap<String, AtomicU64>>,
    /// Messages dead-lettered by source queue
    dead_letters: RwLock<FxHashMap<String, AtomicU64>>,
}

fn bump(map: &RwLock<FxHashMap<String, AtomicU64>>, key: &str) {
    {
        let counters = map.read();
        if let Some(counter) = counters.get(key) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }
    map.write()
        .entry(key.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

fn read(map: &RwLock<FxHashMap<String, AtomicU64>>, key: &str) -> u64 {
    map.read()
        .get(key)
        .map_or(0, |counter| counter.load(Ordering::Relaxed))
}

fn total(map: &RwLock<FxHashMap<String, AtomicU64>>) -> u64 {
    map.read()
        .values()
        .map(|counter| counter.load(Ordering::Relaxed))
        .sum()
}

impl BrokerMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_publish(&self, exchange: &str) {
        bump(&self.published, exchange);
    }

    pub fn record_reply(&self, exchange: &str) {
        bump(&self.replied, exchange);
    }

    pub fn record_timeout(&self, exchange: &str) {
        bump(&self.timeouts, exchange);
    }

    pub fn record_unroutable(&self, exchange: &str) {
        bump(&self.unroutable, exchange);
    }

    pub fn record_dead_letter(&self, queue: &str) {
        bump(&self.dead_letters, queue);
    }

    #[must_use]
    pub fn publish_count(&self, exchange: &str) -> u64 {
        read(&self.published, exchange)
    }

    #[must_use]
    pub fn reply_count(&self, exchange: &str) -> u64 {
        read(&self.replied, exchange)
    }

    #[must_use]
    pub fn timeout_count(&self, exchange: &str) -> u64 {
        read(&self.timeouts, exchange)
    }

    #[must_use]
    pub fn unroutable_count(&self, exchange: &str) -> u64 {
        read(&self.unroutable, exchange)
    }

    #[must_use]
    pub fn dead_letter_count(&self, queue: &str) -> u64 {
        read(&self.dead_letters, queue)
    }

    /// Totals across all exchanges and queues
    #[must_use]
    pub fn summary(&self) -> BrokerMetricsSummary {
        BrokerMetricsSummary {
            published: total(&self.published),
            replied: total(&self.replied),
            timeouts: total(&self.timeouts),
            unroutable: total(&self.unroutable),
            dead_lettered: total(&self.dead_letters),
        }
    }
}

/// Aggregated broker counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerMetricsSummary {
    pub published: u64,
    pub replied: u64,
    pub timeouts: u64,
    pub unroutable: u64,
    pub dead_lettered: u64,
}
