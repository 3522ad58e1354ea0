//! Rate limit middleware tests

use axum::{
    Router,
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
};
use pretty_assertions::assert_eq;
use rstest::*;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

use api_gateway::{
    GatewayConfig, RateLimiter,
    middleware::{
        KeyStrategy, RATE_LIMIT_LIMIT_HEADER, RATE_LIMIT_REMAINING_HEADER,
        RATE_LIMIT_RESET_HEADER, RETRY_AFTER_HEADER, RateLimitPolicy, RateLimitState,
    },
    server,
};

use super::helpers::TestGateway;
use crate::create_test_gateway_config;

/// Long window so a test never straddles a boundary
fn limited_config(limit: u64) -> GatewayConfig {
    let mut config = create_test_gateway_config();
    config.rate_limiting.enabled = true;
    config.rate_limiting.limit = limit;
    config.rate_limiting.window_seconds = 3_600;
    config
}

async fn limited_app(config: GatewayConfig, policy: Option<RateLimitPolicy>) -> Router {
    let gateway = TestGateway::new(config.clone()).await;
    let policy = policy.unwrap_or_else(|| RateLimitPolicy::from_config(&config.rate_limiting));
    let state = RateLimitState {
        limiter: Arc::new(RateLimiter::in_memory("rl-mw")),
        policy: Arc::new(policy),
    };
    server::router(&config, gateway.aggregator, Some(state))
}

/// Send a request as if it arrived on a connection from `peer`
async fn send(
    app: &Router,
    uri: &str,
    peer: &str,
    headers: &[(&str, &str)],
) -> axum::response::Response {
    let mut builder = Request::builder().uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let mut request = builder.body(Body::empty()).expect("request");
    let addr: SocketAddr = peer.parse().expect("socket address");
    request.extensions_mut().insert(ConnectInfo(addr));
    app.clone().oneshot(request).await.expect("response")
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

fn header(response: &axum::response::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[rstest]
#[tokio::test]
async fn test_headers_on_admitted_requests() {
    let app = limited_app(limited_config(3), None).await;

    let response = send(&app, "/health/timeouts", "10.1.1.1:40000", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, RATE_LIMIT_LIMIT_HEADER).as_deref(), Some("3"));
    assert_eq!(header(&response, RATE_LIMIT_REMAINING_HEADER).as_deref(), Some("2"));
    assert!(header(&response, RATE_LIMIT_RESET_HEADER).is_some());
    assert!(header(&response, RETRY_AFTER_HEADER).is_none());
}

#[rstest]
#[tokio::test]
async fn test_rejection_returns_429() {
    let app = limited_app(limited_config(2), None).await;
    let client = "10.2.2.2:40000";

    for _ in 0..2 {
        let response = send(&app, "/health/timeouts", client, &[]).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = send(&app, "/health/timeouts", client, &[]).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&response, RATE_LIMIT_REMAINING_HEADER).as_deref(), Some("0"));
    let retry_after: u64 = header(&response, RETRY_AFTER_HEADER)
        .expect("retry-after")
        .parse()
        .expect("seconds");
    assert!(retry_after > 0 && retry_after <= 3_600);

    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["error"], "rate_limit_exceeded");
    assert_eq!(body["error"]["details"]["client"], "ip:10.2.2.2");
    assert_eq!(body["error"]["details"]["path"], "/health/timeouts");

    // Another origin is unaffected
    let other = send(&app, "/health/timeouts", "10.3.3.3:40000", &[]).await;
    assert_eq!(other.status(), StatusCode::OK);
}

#[rstest]
#[tokio::test]
async fn test_distinct_peers_get_separate_buckets() {
    let app = limited_app(limited_config(1), None).await;

    let a = send(&app, "/health/timeouts", "10.1.1.1:40000", &[]).await;
    let b = send(&app, "/health/timeouts", "10.2.2.2:40000", &[]).await;
    assert_eq!(a.status(), StatusCode::OK);
    assert_eq!(b.status(), StatusCode::OK);

    let again = send(&app, "/health/timeouts", "10.1.1.1:40001", &[]).await;
    assert_eq!(again.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[rstest]
#[tokio::test]
async fn test_forwarded_headers_ignored_by_default() {
    let app = limited_app(limited_config(1), None).await;
    let peer = "10.7.7.7:40000";

    let first = send(&app, "/health/timeouts", peer, &[("X-Forwarded-For", "1.1.1.1")]).await;
    assert_eq!(first.status(), StatusCode::OK);

    // A fresh spoofed address does not buy a fresh budget
    let spoofed = send(&app, "/health/timeouts", peer, &[("X-Forwarded-For", "2.2.2.2")]).await;
    assert_eq!(spoofed.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_json(spoofed).await["error"]["details"]["client"], "ip:10.7.7.7");
}

#[rstest]
#[tokio::test]
async fn test_trusted_forwarded_headers_name_the_client() {
    let mut config = limited_config(1);
    config.rate_limiting.trust_forwarded_headers = true;
    let app = limited_app(config, None).await;
    let proxy = "10.0.0.1:40000";

    let a = send(&app, "/health/timeouts", proxy, &[("X-Forwarded-For", "198.51.100.1")]).await;
    let b = send(&app, "/health/timeouts", proxy, &[("X-Real-IP", "198.51.100.2")]).await;
    assert_eq!(a.status(), StatusCode::OK);
    assert_eq!(b.status(), StatusCode::OK);

    let again = send(&app, "/health/timeouts", proxy, &[("X-Forwarded-For", "198.51.100.1")]).await;
    assert_eq!(again.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_json(again).await["error"]["details"]["client"], "ip:198.51.100.1");
}

#[rstest]
#[tokio::test]
async fn test_skip_paths_bypass_limit() {
    let app = limited_app(limited_config(1), None).await;
    let client = "10.4.4.4:40000";

    for _ in 0..5 {
        let response = send(&app, "/health/ready", client, &[]).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, RATE_LIMIT_LIMIT_HEADER).is_none());
    }

    assert_eq!(send(&app, "/health/timeouts", client, &[]).await.status(), StatusCode::OK);
    assert_eq!(
        send(&app, "/health/timeouts", client, &[]).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[rstest]
#[tokio::test]
async fn test_header_strategy_keys_by_api_key() {
    let mut config = limited_config(1);
    config.rate_limiting.key_strategy = KeyStrategy::Header("x-api-key".to_string());
    let app = limited_app(config, None).await;

    // Same origin, different keys
    let peer = "10.5.5.5:40000";
    let first = [("x-api-key", "alpha")];
    let second = [("x-api-key", "beta")];

    assert_eq!(send(&app, "/health/timeouts", peer, &first).await.status(), StatusCode::OK);
    assert_eq!(send(&app, "/health/timeouts", peer, &second).await.status(), StatusCode::OK);
    assert_eq!(
        send(&app, "/health/timeouts", peer, &first).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[rstest]
#[tokio::test]
async fn test_custom_key_function() {
    let config = limited_config(1);
    let policy = RateLimitPolicy::from_config(&config.rate_limiting).with_key_fn(Arc::new(
        |request: &axum::extract::Request| {
            request
                .headers()
                .get("x-tenant")
                .and_then(|value| value.to_str().ok())
                .map(|tenant| format!("tenant:{tenant}"))
        },
    ));
    let app = limited_app(config, Some(policy)).await;

    // Different origins share the tenant's budget
    let tenant = [("x-tenant", "acme")];

    assert_eq!(
        send(&app, "/health/timeouts", "10.6.6.1:40000", &tenant).await.status(),
        StatusCode::OK
    );
    assert_eq!(
        send(&app, "/health/timeouts", "10.6.6.2:40000", &tenant).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[rstest]
#[tokio::test]
async fn test_disabled_rate_limiting_builds_no_layer() {
    let config = create_test_gateway_config();
    assert!(server::build_rate_limit(&config).expect("build").is_none());

    let enabled = limited_config(10);
    let state = server::build_rate_limit(&enabled).expect("build").expect("enabled");
    assert_eq!(state.limiter.store_name(), "memory");
    assert_eq!(state.policy.options.limit, 10);
}

#[rstest]
#[tokio::test]
async fn test_invalid_options_are_rejected_at_startup() {
    let mut config = limited_config(10);
    config.rate_limiting.window_seconds = 0;
    assert!(server::build_rate_limit(&config).is_err());
}
