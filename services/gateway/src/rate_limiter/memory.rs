//! In-process store running the window evaluation under one lock

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{RateLimitError, RateLimitResult, RateLimitStore, WindowRequest};

// Expired entries are swept once the map grows past this
const SWEEP_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: u64,
    expires_at: u64,
}

/// Store for single-process deployments and tests
#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    entries: Mutex<FxHashMap<String, Entry>>,
}

impl MemoryRateLimitStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys, including expired ones not yet swept
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn live(entries: &FxHashMap<String, Entry>, key: &str, now: u64) -> Option<Entry> {
        entries.get(key).copied().filter(|entry| entry.expires_at > now)
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn evaluate(&self, request: &WindowRequest) -> Result<RateLimitResult, RateLimitError> {
        let now = request.now_secs;
        let mut entries = self.entries.lock();

        if entries.len() > SWEEP_THRESHOLD {
            entries.retain(|_, entry| entry.expires_at > now);
        }

        let current = Self::live(&entries, &request.window_key, now).map_or(0, |e| e.value);

        if let Some(block) = Self::live(&entries, &request.block_key, now) {
            let block_ttl = block.expires_at - now;
            return Ok(RateLimitResult {
                allowed: false,
                total_hits: current,
                remaining: 0,
                reset_seconds: block_ttl,
                retry_after_seconds: Some(block_ttl),
            });
        }

        let count = current + request.points;
        if count <= request.effective_limit {
            entries.insert(
                request.window_key.clone(),
                Entry {
                    value: count,
                    expires_at: now + request.window_seconds,
                },
            );
            return Ok(RateLimitResult {
                allowed: true,
                total_hits: count,
                remaining: request.effective_limit - count,
                reset_seconds: request.reset_seconds,
                retry_after_seconds: None,
            });
        }

        if request.block_seconds > 0 {
            entries.insert(
                request.block_key.clone(),
                Entry {
                    value: 1,
                    expires_at: now + request.block_seconds,
                },
            );
            return Ok(RateLimitResult {
                allowed: false,
                total_hits: count,
                remaining: 0,
                reset_seconds: request.block_seconds,
                retry_after_seconds: Some(request.block_seconds),
            });
        }

        Ok(RateLimitResult {
            allowed: false,
            total_hits: count,
            remaining: 0,
            reset_seconds: request.reset_seconds,
            retry_after_seconds: Some(request.reset_seconds),
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
