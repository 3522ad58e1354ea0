//! Redis-backed store evaluating the window in one Lua script

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tracing::info;

use super::{RateLimitError, RateLimitResult, RateLimitStore, WindowRequest};

// KEYS: window, block
// ARGV: points, effective limit, window seconds, block seconds, reset seconds
// Reply: allowed, total hits, remaining, reset seconds, retry after (-1 for none)
const WINDOW_SCRIPT: &str = r"
local window_key = KEYS[1]
local block_key = KEYS[2]
local points = tonumber(ARGV[1])
local effective_limit = tonumber(ARGV[2])
local window_seconds = tonumber(ARGV[3])
local block_seconds = tonumber(ARGV[4])
local reset_seconds = tonumber(ARGV[5])

local current = tonumber(redis.call('GET', window_key) or '0')

local block_ttl = redis.call('TTL', block_key)
if block_ttl > 0 then
  return {0, current, 0, block_ttl, block_ttl}
end

local count = current + points
if count <= effective_limit then
  redis.call('SET', window_key, count, 'EX', window_seconds)
  return {1, count, effective_limit - count, reset_seconds, -1}
end

if block_seconds > 0 then
  redis.call('SET', block_key, 1, 'EX', block_seconds)
  return {0, count, 0, block_seconds, block_seconds}
end

return {0, count, 0, reset_seconds, reset_seconds}
";

/// Shared store backed by Redis
///
/// The connection is established on first use, so an unreachable Redis at
/// startup degrades to fail-open instead of aborting the gateway.
pub struct RedisRateLimitStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    script: redis::Script,
}

impl RedisRateLimitStore {
    pub fn new(url: &str) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            script: redis::Script::new(WINDOW_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, RateLimitError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let manager = self.client.get_connection_manager().await?;
                info!("Connected to rate limit store");
                Ok::<_, RateLimitError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn evaluate(&self, request: &WindowRequest) -> Result<RateLimitResult, RateLimitError> {
        let mut connection = self.connection().await?;

        let reply: Vec<i64> = self
            .script
            .key(&request.window_key)
            .key(&request.block_key)
            .arg(request.points)
            .arg(request.effective_limit)
            .arg(request.window_seconds)
            .arg(request.block_seconds)
            .arg(request.reset_seconds)
            .invoke_async(&mut connection)
            .await?;

        parse_reply(&reply)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

fn parse_reply(reply: &[i64]) -> Result<RateLimitResult, RateLimitError> {
    let [allowed, total_hits, remaining, reset_seconds, retry_after] = reply else {
        return Err(RateLimitError::MalformedReply(format!(
            "expected 5 integers, got {}",
            reply.len()
        )));
    };

    let non_negative = |value: i64| u64::try_from(value).unwrap_or_default();
    Ok(RateLimitResult {
        allowed: *allowed == 1,
        total_hits: non_negative(*total_hits),
        remaining: non_negative(*remaining),
        reset_seconds: non_negative(*reset_seconds),
        retry_after_seconds: u64::try_from(*retry_after).ok(),
    })
}
