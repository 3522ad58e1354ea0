//! Bucketed rolling counters
//!
//! A fixed window is split into N equal buckets. Each bucket remembers the
//! epoch (absolute bucket index) it was last written in, so stale buckets
//! are recycled on write and skipped on read. Memory is bounded by N.

#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// What happened to a single call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// Refused without invoking the target
    Rejection,
}

/// Aggregate counts over the unexpired buckets
///
/// `requests` counts invoked calls only; rejections are tracked separately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowCounts {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

impl WindowCounts {
    /// Failures as a percentage of invoked calls, 0 when idle
    #[must_use]
    pub fn failure_percentage(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.failures as f64 * 100.0 / self.requests as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    epoch: u64,
    successes: u64,
    failures: u64,
    rejections: u64,
}

#[derive(Debug, Clone)]
pub struct RollingWindow {
    origin: Instant,
    bucket_width: Duration,
    buckets: Vec<Bucket>,
}

impl RollingWindow {
    pub fn new(window: Duration, buckets: usize, now: Instant) -> Self {
        let buckets = buckets.max(1);
        let bucket_width = (window / buckets as u32).max(Duration::from_millis(1));
        Self {
            origin: now,
            bucket_width,
            buckets: vec![Bucket::default(); buckets],
        }
    }

    fn epoch_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin).as_nanos();
        (elapsed / self.bucket_width.as_nanos()) as u64
    }

    pub fn record(&mut self, outcome: Outcome, now: Instant) {
        let epoch = self.epoch_at(now);
        let slot = (epoch % self.buckets.len() as u64) as usize;
        let bucket = &mut self.buckets[slot];

        if bucket.epoch != epoch {
            *bucket = Bucket {
                epoch,
                ..Bucket::default()
            };
        }

        match outcome {
            Outcome::Success => bucket.successes += 1,
            Outcome::Failure => bucket.failures += 1,
            Outcome::Rejection => bucket.rejections += 1,
        }
    }

    #[must_use]
    pub fn totals(&self, now: Instant) -> WindowCounts {
        let current = self.epoch_at(now);
        let span = self.buckets.len() as u64;

        let mut counts = WindowCounts::default();
        for bucket in self
            .buckets
            .iter()
            .filter(|b| b.epoch <= current && b.epoch + span > current)
        {
            counts.successes += bucket.successes;
            counts.failures += bucket.failures;
            counts.rejections += bucket.rejections;
        }
        counts.requests = counts.successes + counts.failures;
        counts
    }

    /// Drop every bucket and restart the window at `now`
    pub fn reset(&mut self, now: Instant) {
        self.origin = now;
        self.buckets.fill(Bucket::default());
    }
}
