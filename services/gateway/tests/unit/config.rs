//! Configuration loading tests

use pretty_assertions::assert_eq;
use rstest::*;
use serial_test::serial;
use services_common::{Environment, ServiceTier};
use std::io::Write;

use api_gateway::GatewayConfig;
use api_gateway::middleware::KeyStrategy;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp file");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[rstest]
fn test_defaults() {
    let config = GatewayConfig::default();

    assert_eq!(config.server_address(), "127.0.0.1:8080");
    assert_eq!(config.deployment_environment(), Environment::Development);
    assert!(config.rate_limiting.enabled);
    assert_eq!(config.rate_limiting.limit, 100);
    assert_eq!(config.rate_limiting.window_seconds, 60);
    assert_eq!(config.rate_limiting.key_strategy, KeyStrategy::Ip);
    assert!(!config.rate_limiting.trust_forwarded_headers);
    assert_eq!(config.monitoring.health_path, "/health");

    let names: Vec<_> = config.services.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["auth", "billing", "deploy", "monitor"]);
    assert_eq!(config.services[0].tier, ServiceTier::Critical);
}

#[rstest]
#[serial]
fn test_load_from_toml() {
    let file = write_config(
        r#"
environment = "production"

[server]
host = "0.0.0.0"
port = 9000

[rate_limiting]
limit = 20
burst = 5
key_strategy = "header:X-Api-Key"
redis_url = "redis://cache:6379/0"

[circuit_breaker]
volume_threshold = 10
error_threshold_percentage = 25.0

[[services]]
name = "ledger"
tier = "critical"

[[services]]
name = "reports"
tier = "non_critical"
"#,
    );

    let path = file.path().to_str().expect("utf-8 path");
    let config = GatewayConfig::from_file(path).expect("load");

    assert_eq!(config.server_address(), "0.0.0.0:9000");
    // Unset fields keep their defaults
    assert_eq!(config.server.timeout_seconds, 30);
    assert_eq!(config.deployment_environment(), Environment::Production);
    assert_eq!(config.rate_limiting.limit, 20);
    assert_eq!(config.rate_limiting.burst, 5);
    assert_eq!(
        config.rate_limiting.key_strategy,
        KeyStrategy::Header("x-api-key".to_string())
    );
    assert_eq!(config.rate_limiting.redis_url.as_deref(), Some("redis://cache:6379/0"));
    assert_eq!(config.circuit_breaker.volume_threshold, 10);
    assert_eq!(config.services.len(), 2);
    assert_eq!(config.services[1].tier, ServiceTier::NonCritical);
    assert_eq!(config.services[1].exchange, "services.rpc");
}

#[rstest]
#[serial]
fn test_invalid_key_strategy_is_rejected() {
    let file = write_config(
        r#"
[rate_limiting]
key_strategy = "cookie"
"#,
    );
    let path = file.path().to_str().expect("utf-8 path");
    assert!(GatewayConfig::from_file(path).is_err());
}

#[rstest]
#[serial]
fn test_environment_overrides_file() {
    let file = write_config(
        r#"
[server]
port = 9000
"#,
    );
    let path = file.path().to_str().expect("utf-8 path");

    // SAFETY: serialized with every other test touching the environment
    unsafe { std::env::set_var("GATEWAY__SERVER__PORT", "9100") };
    let loaded = GatewayConfig::from_file(path);
    unsafe { std::env::remove_var("GATEWAY__SERVER__PORT") };

    assert_eq!(loaded.expect("load").server.port, 9100);
}

#[rstest]
#[case("development")]
#[case("staging")]
#[case("production")]
#[case("test")]
fn test_default_deadlines_fit_request_timeout(#[case] environment: &str) {
    let config = GatewayConfig {
        environment: environment.to_string(),
        ..GatewayConfig::default()
    };
    assert!(config.validate().is_ok());
}

#[rstest]
fn test_health_deadline_beyond_request_timeout_is_rejected() {
    let mut config = GatewayConfig {
        environment: "production".to_string(),
        ..GatewayConfig::default()
    };
    config.server.timeout_seconds = 1;

    let error = config.validate().expect_err("health check deadline exceeds request timeout");
    // Non-critical monitor target: 15s scaled by 1.5
    assert!(error.to_string().contains("'monitor' (22500ms)"));
}

#[rstest]
fn test_missing_file_is_an_error() {
    assert!(GatewayConfig::from_file("/nonexistent/gateway.toml").is_err());
}
