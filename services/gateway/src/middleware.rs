//! Middleware for rate limiting and request logging

use axum::{
    Json,
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::RateLimitConfig;
use crate::models::{ApiResponse, ErrorResponse};
use crate::rate_limiter::{RateLimitOptions, RateLimitResult, RateLimiter};

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";
pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// How the client key is derived from a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KeyStrategy {
    /// Origin address from proxy headers
    Ip,
    /// Value of a request header, falling back to the origin address
    Header(String),
}

impl TryFrom<String> for KeyStrategy {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("ip") {
            return Ok(Self::Ip);
        }
        match trimmed.split_once(':') {
            Some((kind, name)) if kind.eq_ignore_ascii_case("header") && !name.is_empty() => {
                Ok(Self::Header(name.trim().to_ascii_lowercase()))
            }
            _ => Err(format!(
                "unknown key strategy '{value}', expected 'ip' or 'header:<name>'"
            )),
        }
    }
}

impl From<KeyStrategy> for String {
    fn from(strategy: KeyStrategy) -> Self {
        strategy.to_string()
    }
}

impl fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip => f.write_str("ip"),
            Self::Header(name) => write!(f, "header:{name}"),
        }
    }
}

/// Caller-supplied key derivation; `None` falls back to the configured strategy
pub type KeyFn = Arc<dyn Fn(&Request) -> Option<String> + Send + Sync>;
/// Caller-supplied skip condition
pub type SkipFn = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Everything the middleware needs to decide on one request
#[derive(Clone)]
pub struct RateLimitPolicy {
    pub options: RateLimitOptions,
    pub strategy: KeyStrategy,
    /// Whether proxy headers may name the client address
    pub trust_forwarded_headers: bool,
    pub skip_paths: Vec<String>,
    pub custom_key: Option<KeyFn>,
    pub skip_when: Option<SkipFn>,
}

impl fmt::Debug for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitPolicy")
            .field("options", &self.options)
            .field("strategy", &self.strategy)
            .field("trust_forwarded_headers", &self.trust_forwarded_headers)
            .field("skip_paths", &self.skip_paths)
            .field("custom_key", &self.custom_key.is_some())
            .field("skip_when", &self.skip_when.is_some())
            .finish()
    }
}

impl RateLimitPolicy {
    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            options: RateLimitOptions {
                window_seconds: config.window_seconds,
                limit: config.limit,
                block_seconds: config.block_seconds,
                points: config.points,
                burst: config.burst,
            },
            strategy: config.key_strategy.clone(),
            trust_forwarded_headers: config.trust_forwarded_headers,
            skip_paths: config.skip_paths.clone(),
            custom_key: None,
            skip_when: None,
        }
    }

    #[must_use]
    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.custom_key = Some(key_fn);
        self
    }

    #[must_use]
    pub fn with_skip_fn(mut self, skip_fn: SkipFn) -> Self {
        self.skip_when = Some(skip_fn);
        self
    }

    #[must_use]
    pub fn should_skip(&self, request: &Request) -> bool {
        let path = request.uri().path();
        self.skip_paths.iter().any(|prefix| path.starts_with(prefix.as_str()))
            || self.skip_when.as_ref().is_some_and(|skip| skip(request))
    }

    fn client_ip(&self, request: &Request) -> String {
        get_client_ip(request, self.trust_forwarded_headers)
    }

    #[must_use]
    pub fn client_key(&self, request: &Request) -> String {
        if let Some(key) = self.custom_key.as_ref().and_then(|key_fn| key_fn(request)) {
            return key;
        }

        match &self.strategy {
            KeyStrategy::Ip => format!("ip:{}", self.client_ip(request)),
            KeyStrategy::Header(name) => request
                .headers()
                .get(name.as_str())
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty())
                .map_or_else(
                    || format!("ip:{}", self.client_ip(request)),
                    |value| format!("{name}:{value}"),
                ),
        }
    }
}

/// Rate limiting middleware state
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub policy: Arc<RateLimitPolicy>,
}

impl fmt::Debug for RateLimitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitState")
            .field("limiter", &self.limiter)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Create standardized error response
pub(crate) fn create_error_response(
    error_code: &str,
    message: &str,
    details: Option<FxHashMap<String, String>>,
) -> ErrorResponse {
    ErrorResponse {
        error: error_code.to_string(),
        message: message.to_string(),
        details,
    }
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    if state.policy.should_skip(&request) {
        return next.run(request).await;
    }

    let client_key = state.policy.client_key(&request);
    let options = state.policy.options;
    let result = state.limiter.check(&client_key, &options).await;

    if result.allowed {
        let mut response = next.run(request).await;
        apply_rate_limit_headers(&mut response, &options, &result);
        return response;
    }

    let path = request.uri().path().to_string();
    #[cfg(feature = "monitoring")]
    let route = route_label(&request);
    warn!(
        client = %client_key,
        path = %path,
        total_hits = result.total_hits,
        "Rate limit exceeded"
    );
    #[cfg(feature = "monitoring")]
    crate::metrics::get_metrics().record_rate_limit_exceeded(&route);

    let error_response = create_error_response(
        "rate_limit_exceeded",
        "Too many requests - rate limit exceeded",
        Some(
            [
                ("client".to_string(), client_key),
                ("path".to_string(), path),
            ]
            .into_iter()
            .collect(),
        ),
    );

    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ApiResponse::<()>::error(error_response)),
    )
        .into_response();
    apply_rate_limit_headers(&mut response, &options, &result);
    response
}

fn apply_rate_limit_headers(
    response: &mut Response,
    options: &RateLimitOptions,
    result: &RateLimitResult,
) {
    let headers = response.headers_mut();
    let mut set = |name: &'static str, value: u64| {
        headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
    };

    set(RATE_LIMIT_LIMIT_HEADER, options.effective_limit());
    set(RATE_LIMIT_REMAINING_HEADER, result.remaining);
    set(RATE_LIMIT_RESET_HEADER, result.reset_seconds);
    if let Some(retry_after) = result.retry_after_seconds {
        set(RETRY_AFTER_HEADER, retry_after);
    }
}

/// Request logging middleware
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let start = std::time::Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    #[cfg(feature = "monitoring")]
    let route = route_label(&request);
    let client_ip = get_client_ip(&request, false);

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();

    info!(
        method = %method,
        uri = %uri,
        status = %status,
        duration_ms = duration.as_millis(),
        client_ip = %client_ip,
        "Request processed"
    );

    #[cfg(feature = "monitoring")]
    crate::metrics::get_metrics().record_http_request(
        method.as_str(),
        &route,
        status.as_u16(),
        duration.as_secs_f64(),
    );

    response
}

/// Route template of a request, `unmatched` when no route matched
///
/// Used as the metrics label so arbitrary paths cannot mint new series.
#[must_use]
pub fn route_label(request: &Request) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |path| path.as_str().to_string())
}

/// Extract client IP from request
///
/// Proxy headers are consulted only when `trust_forwarded` is set; otherwise
/// the peer address of the connection is used.
#[must_use]
pub fn get_client_ip(request: &Request, trust_forwarded: bool) -> String {
    if trust_forwarded {
        // X-Forwarded-For first (load balancers and proxies)
        let forwarded = request
            .headers()
            .get("X-Forwarded-For")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }

        let real_ip = request
            .headers()
            .get("X-Real-IP")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = real_ip {
            return ip.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |ConnectInfo(addr)| addr.ip().to_string())
}
