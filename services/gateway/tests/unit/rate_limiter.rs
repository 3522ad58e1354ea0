//! Rate limiter tests
//!
//! Tests cover:
//! - Fixed window admission and rollover
//! - Burst allowance, weighted points and blocking
//! - Per-client isolation
//! - Failing open when the store is unavailable
//! - Atomicity under concurrent checks

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use rstest::*;
use std::sync::Arc;
use tokio_test::assert_ok;

use api_gateway::rate_limiter::{
    MemoryRateLimitStore, RateLimitError, RateLimitOptions, RateLimitResult, RateLimitStore,
    RateLimiter, RedisRateLimitStore, WindowRequest,
};

// Start of a 60s window
const T0: u64 = 1_700_000_040;

#[fixture]
fn limiter() -> RateLimiter {
    RateLimiter::in_memory("rl-test")
}

fn options(limit: u64) -> RateLimitOptions {
    RateLimitOptions {
        window_seconds: 60,
        limit,
        ..RateLimitOptions::default()
    }
}

#[rstest]
#[tokio::test]
async fn test_window_admits_limit_then_rejects(limiter: RateLimiter) {
    let options = options(10);

    for i in 1..=10 {
        let result = limiter.check_at("10.0.0.1", &options, T0 + 5).await;
        assert!(result.allowed, "request {i} should be admitted");
        assert_eq!(result.total_hits, i);
        assert_eq!(result.remaining, 10 - i);
        assert_eq!(result.reset_seconds, 55);
        assert_eq!(result.retry_after_seconds, None);
    }

    let rejected = limiter.check_at("10.0.0.1", &options, T0 + 5).await;
    assert!(!rejected.allowed);
    assert_eq!(rejected.total_hits, 11);
    assert_eq!(rejected.remaining, 0);
    assert_eq!(rejected.retry_after_seconds, Some(55));

    // Next window
    let admitted = limiter.check_at("10.0.0.1", &options, T0 + 60).await;
    assert!(admitted.allowed);
    assert_eq!(admitted.total_hits, 1);
    assert_eq!(admitted.reset_seconds, 60);
}

#[rstest]
#[tokio::test]
async fn test_rejections_do_not_consume_quota(limiter: RateLimiter) {
    let options = options(2);

    for _ in 0..2 {
        assert!(limiter.check_at("k", &options, T0).await.allowed);
    }
    for _ in 0..5 {
        assert!(!limiter.check_at("k", &options, T0).await.allowed);
    }

    let next = limiter.check_at("k", &options, T0 + 60).await;
    assert!(next.allowed);
    assert_eq!(next.remaining, 1);
}

#[rstest]
#[tokio::test]
async fn test_burst_extends_limit(limiter: RateLimiter) {
    let options = RateLimitOptions {
        burst: 2,
        ..options(10)
    };

    let mut admitted = 0;
    for _ in 0..20 {
        if limiter.check_at("burst", &options, T0).await.allowed {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 12);
}

#[rstest]
#[tokio::test]
async fn test_block_outlasts_window(limiter: RateLimiter) {
    let options = RateLimitOptions {
        block_seconds: 300,
        ..options(3)
    };

    for _ in 0..3 {
        assert!(limiter.check_at("abuser", &options, T0).await.allowed);
    }

    let rejected = limiter.check_at("abuser", &options, T0).await;
    assert!(!rejected.allowed);
    assert_eq!(rejected.retry_after_seconds, Some(300));
    assert_eq!(rejected.reset_seconds, 300);

    // Window has rolled over but the block holds
    let blocked = limiter.check_at("abuser", &options, T0 + 120).await;
    assert!(!blocked.allowed);
    assert_eq!(blocked.retry_after_seconds, Some(180));

    let released = limiter.check_at("abuser", &options, T0 + 300).await;
    assert!(released.allowed);
    assert_eq!(released.total_hits, 1);
}

#[rstest]
#[tokio::test]
async fn test_points_weight_requests(limiter: RateLimiter) {
    let options = RateLimitOptions {
        points: 4,
        ..options(10)
    };

    let first = limiter.check_at("heavy", &options, T0).await;
    assert!(first.allowed);
    assert_eq!(first.total_hits, 4);
    assert_eq!(first.remaining, 6);

    assert!(limiter.check_at("heavy", &options, T0).await.allowed);

    // 12 > 10
    let third = limiter.check_at("heavy", &options, T0).await;
    assert!(!third.allowed);
    assert_eq!(third.total_hits, 12);
}

#[rstest]
#[tokio::test]
async fn test_clients_are_isolated(limiter: RateLimiter) {
    let options = options(1);

    assert!(limiter.check_at("ip:10.0.0.1", &options, T0).await.allowed);
    assert!(!limiter.check_at("ip:10.0.0.1", &options, T0).await.allowed);
    assert!(limiter.check_at("ip:10.0.0.2", &options, T0).await.allowed);
}

#[rstest]
#[tokio::test]
async fn test_prefixes_are_isolated() {
    let store = Arc::new(MemoryRateLimitStore::new());
    let public = RateLimiter::new(store.clone(), "public");
    let admin = RateLimiter::new(store.clone(), "admin");
    let options = options(1);

    assert!(public.check_at("k", &options, T0).await.allowed);
    assert!(admin.check_at("k", &options, T0).await.allowed);
    assert_eq!(store.len(), 2);
}

/// Store that is always unreachable
struct UnavailableStore;

#[async_trait]
impl RateLimitStore for UnavailableStore {
    async fn evaluate(&self, _request: &WindowRequest) -> Result<RateLimitResult, RateLimitError> {
        Err(RateLimitError::MalformedReply("connection reset".to_string()))
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}

#[rstest]
#[tokio::test]
async fn test_store_failure_fails_open() {
    let limiter = RateLimiter::new(Arc::new(UnavailableStore), "rl");
    let options = options(1);

    for _ in 0..5 {
        let result = limiter.check_at("k", &options, T0 + 10).await;
        assert!(result.allowed);
        assert_eq!(result.total_hits, 0);
        assert_eq!(result.remaining, 1);
        assert_eq!(result.reset_seconds, 50);
        assert_eq!(result.retry_after_seconds, None);
    }
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checks_admit_exactly_limit() {
    let limiter = Arc::new(RateLimiter::in_memory("rl"));
    let options = options(10);

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.check_at("shared", &options, T0).await })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        let result = assert_ok!(handle.await);
        if result.allowed {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
}

#[rstest]
#[tokio::test]
async fn test_check_uses_wall_clock(limiter: RateLimiter) {
    let options = RateLimitOptions {
        window_seconds: 3_600,
        ..options(1)
    };

    let result = limiter.check("wall", &options).await;
    assert!(result.allowed);
    assert!(result.reset_seconds >= 1 && result.reset_seconds <= 3_600);
}

/// Replay `hits` checks for one client against a store
async fn replay(
    store: &dyn RateLimitStore,
    prefix: &str,
    options: &RateLimitOptions,
    hits: usize,
    now_secs: u64,
) -> Vec<RateLimitResult> {
    let request = WindowRequest::new(prefix, "ip:10.8.8.8", options, now_secs);
    let mut results = Vec::with_capacity(hits);
    for _ in 0..hits {
        results.push(store.evaluate(&request).await.expect("store reply"));
    }
    results
}

/// Runs the window script on a live Redis and compares it with the
/// in-process store. Needs `REDIS_URL`.
#[tokio::test]
#[ignore = "requires a Redis server at REDIS_URL"]
async fn test_redis_script_matches_memory_store() {
    let Ok(url) = std::env::var("REDIS_URL") else {
        return;
    };
    let redis = RedisRateLimitStore::new(&url).expect("redis url");
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let prefix = |case: &str| format!("rl-script-{nanos}-{case}");

    // Window: limit admitted, then rejected until the next window
    let window = options(10);
    let expected = replay(&MemoryRateLimitStore::new(), "w", &window, 11, T0 + 5).await;
    let actual = replay(&redis, &prefix("window"), &window, 11, T0 + 5).await;
    assert_eq!(actual, expected);
    assert_eq!(actual.iter().filter(|r| r.allowed).count(), 10);
    let rejected = &actual[10];
    assert!(!rejected.allowed);
    assert_eq!(rejected.retry_after_seconds, Some(55));

    let next = replay(&redis, &prefix("window"), &window, 1, T0 + 60).await;
    assert!(next[0].allowed);
    assert_eq!(next[0].total_hits, 1);

    // Burst: limit plus burst admitted
    let burst = RateLimitOptions {
        burst: 2,
        ..options(10)
    };
    let expected = replay(&MemoryRateLimitStore::new(), "b", &burst, 13, T0).await;
    let actual = replay(&redis, &prefix("burst"), &burst, 13, T0).await;
    assert_eq!(actual, expected);
    assert_eq!(actual.iter().filter(|r| r.allowed).count(), 12);

    // Block: a rejection blocks the client past the window
    let block = RateLimitOptions {
        block_seconds: 300,
        ..options(1)
    };
    let actual = replay(&redis, &prefix("block"), &block, 2, T0).await;
    assert!(actual[0].allowed);
    assert!(!actual[1].allowed);
    assert_eq!(actual[1].retry_after_seconds, Some(300));

    let still_blocked = replay(&redis, &prefix("block"), &block, 1, T0 + 60).await;
    assert!(!still_blocked[0].allowed);
    assert!(still_blocked[0].retry_after_seconds.is_some_and(|s| s > 0 && s <= 300));
}
