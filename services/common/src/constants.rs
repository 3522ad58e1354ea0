//! Common constants used across all services
//!
//! COMPLIANCE: Single source of truth for all magic numbers

// Time constants
pub const MILLIS_PER_SEC: u64 = 1000;
pub const SECS_PER_MIN: u64 = 60;

// Timeout policy
/// No resolved deadline is ever shorter than this
pub const MIN_TIMEOUT_FLOOR_MS: u64 = 500;
pub const CRITICAL_TIER_TIMEOUT_MS: u64 = 5_000;
pub const STANDARD_TIER_TIMEOUT_MS: u64 = 10_000;
pub const NON_CRITICAL_TIER_TIMEOUT_MS: u64 = 15_000;

pub const DEFAULT_RPC_CALL_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_STORAGE_OP_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_OUTBOUND_HTTP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 2_000;

pub const PRODUCTION_TIMEOUT_SCALE: f64 = 1.5;
pub const STAGING_TIMEOUT_SCALE: f64 = 1.2;
pub const DEVELOPMENT_TIMEOUT_SCALE: f64 = 0.5;
pub const TEST_TIMEOUT_SCALE: f64 = 0.1;

// Circuit breaker defaults
pub const DEFAULT_VOLUME_THRESHOLD: u64 = 5;
pub const DEFAULT_ERROR_THRESHOLD_PERCENTAGE: f64 = 50.0;
pub const DEFAULT_RESET_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_ROLLING_WINDOW_MS: u64 = 10_000;
pub const DEFAULT_ROLLING_BUCKETS: usize = 10;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_MAX_RESET_TIMEOUT_MS: u64 = 300_000;

// Retry constants
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 100;
pub const MAX_RETRY_DELAY_MS: u64 = 5000;

// Broker defaults
pub const DEFAULT_RPC_EXCHANGE: &str = "services.rpc";
pub const DEFAULT_DEAD_LETTER_EXCHANGE: &str = "services.dlx";
pub const DEFAULT_DEAD_LETTER_QUEUE: &str = "services.dead-letter";
pub const PLATFORM_EVENTS_EXCHANGE: &str = "platform.events";
pub const GATEWAY_EVENTS_QUEUE: &str = "gateway.events";
pub const DEFAULT_QUEUE_MESSAGE_TTL_MS: u64 = 60_000;
pub const DEFAULT_QUEUE_MAX_LENGTH: usize = 10_000;

// Buffer sizes
pub const DEFAULT_CHANNEL_SIZE: usize = 1000;
