//! Health aggregator tests
//!
//! Tests cover:
//! - Reduction of mixed results
//! - Open circuits short-circuiting without a network call
//! - Fan-out latency independent of the number of targets
//! - Order independence of the reduction
//! - Reply mapping, debug info and administrative resets

use pretty_assertions::assert_eq;
use rstest::*;
use serde_json::json;
use services_common::{BreakerConfig, CircuitState};
use std::time::Duration;
use tokio::time::Instant;

use api_gateway::health::{HealthStatus, reduce_status};

use super::helpers::{Behaviour, TestGateway, standard_targets};
use crate::{create_test_gateway_config, create_test_gateway_config_for, init_test_env};

/// Trips after a single failure
fn hair_trigger() -> BreakerConfig {
    BreakerConfig {
        volume_threshold: 1,
        ..BreakerConfig::default()
    }
}

#[rstest]
#[tokio::test]
async fn test_all_healthy() {
    init_test_env();
    let gateway = TestGateway::new(create_test_gateway_config()).await;
    gateway.serve_all_healthy();

    let report = gateway.aggregator.check_all().await;
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(
        report.services.keys().cloned().collect::<Vec<_>>(),
        vec!["auth", "billing", "deploy", "monitor"]
    );
    for result in report.services.values() {
        assert_eq!(result.status, HealthStatus::Healthy);
        assert!(result.metadata.error.is_none());
        assert!(!result.is_circuit_derived());
        assert_eq!(result.metadata.circuit_state, Some(CircuitState::Closed));
    }
}

#[rstest]
#[tokio::test]
async fn test_open_circuit_degrades_without_probe() {
    init_test_env();
    let mut config = create_test_gateway_config();
    config.circuit_breaker = hair_trigger();
    let gateway = TestGateway::new(config).await;

    for name in ["auth", "billing", "deploy"] {
        gateway.serve(name, Behaviour::Healthy);
    }
    let monitor = gateway.serve("monitor", Behaviour::Fail);

    // First round trips the monitor breaker
    let first = gateway.aggregator.check_all().await;
    assert_eq!(first.status, HealthStatus::Degraded);
    assert!(!first.services["monitor"].is_circuit_derived());
    assert_eq!(monitor.calls(), 1);
    assert_eq!(gateway.aggregator.breakers().state_of("monitor"), CircuitState::Open);

    let second = gateway.aggregator.check_all().await;
    assert_eq!(second.status, HealthStatus::Degraded);

    let entry = &second.services["monitor"];
    assert_eq!(entry.status, HealthStatus::Unhealthy);
    assert!(entry.is_circuit_derived());
    assert_eq!(entry.metadata.circuit_state, Some(CircuitState::Open));
    assert_eq!(entry.metadata.error.as_deref(), Some("Circuit open: monitor"));
    assert_eq!(monitor.calls(), 1, "no network call for an open circuit");
}

#[rstest]
#[tokio::test]
async fn test_all_failing_is_unhealthy() {
    init_test_env();
    let gateway = TestGateway::new(create_test_gateway_config()).await;
    for target in gateway.config.services.clone() {
        gateway.serve(&target.name, Behaviour::Fail);
    }

    let report = gateway.aggregator.check_all().await;
    assert_eq!(report.status, HealthStatus::Unhealthy);
    for (name, result) in &report.services {
        assert_eq!(result.status, HealthStatus::Unhealthy);
        let error = result.metadata.error.as_deref().expect("error text");
        assert!(error.contains("is down"), "{name}: {error}");
        assert_eq!(result.metadata.routing_key, Some(format!("{name}.health")));
        assert_eq!(result.metadata.exchange.as_deref(), Some("services.rpc"));
    }
}

#[rstest]
#[tokio::test]
async fn test_missing_consumers_do_not_fail_aggregation() {
    init_test_env();
    let gateway = TestGateway::new(create_test_gateway_config()).await;

    let report = gateway.aggregator.check_all().await;
    assert_eq!(report.status, HealthStatus::Unhealthy);
    assert_eq!(report.services.len(), 4);
    assert!(
        report.services["auth"]
            .metadata
            .error
            .as_deref()
            .is_some_and(|e| e.contains("auth.requests"))
    );
}

#[rstest]
#[case(1)]
#[case(4)]
#[case(50)]
#[tokio::test(start_paused = true)]
async fn test_latency_independent_of_target_count(#[case] n: usize) {
    let gateway = TestGateway::new(create_test_gateway_config_for(standard_targets(n))).await;
    for target in gateway.config.services.clone() {
        gateway.serve(&target.name, Behaviour::Slow(Duration::from_millis(800)));
    }

    let started = Instant::now();
    let report = gateway.aggregator.check_all().await;
    let elapsed = started.elapsed();

    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.services.len(), n);
    assert!(elapsed >= Duration::from_millis(800));
    assert!(elapsed < Duration::from_millis(900), "took {elapsed:?} for {n} targets");
}

#[rstest]
#[case(1)]
#[case(4)]
#[case(50)]
#[tokio::test(start_paused = true)]
async fn test_latency_bounded_by_deadline(#[case] n: usize) {
    let gateway = TestGateway::new(create_test_gateway_config_for(standard_targets(n))).await;
    for target in gateway.config.services.clone() {
        gateway.serve(&target.name, Behaviour::Slow(Duration::from_secs(30)));
    }

    let started = Instant::now();
    let report = gateway.aggregator.check_all().await;
    let elapsed = started.elapsed();

    // Standard tier, test environment: 1s health deadline
    assert_eq!(report.status, HealthStatus::Unhealthy);
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_millis(1_100), "took {elapsed:?} for {n} targets");
    for result in report.services.values() {
        assert!(
            result
                .metadata
                .error
                .as_deref()
                .is_some_and(|e| e.contains("timed out") || e.contains("Deadline"))
        );
    }
}

fn permutations(items: &[HealthStatus]) -> Vec<Vec<HealthStatus>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut all = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let head = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, head);
            all.push(tail);
        }
    }
    all
}

#[rstest]
#[case(vec![HealthStatus::Healthy, HealthStatus::Healthy, HealthStatus::Healthy, HealthStatus::Unhealthy])]
#[case(vec![HealthStatus::Healthy, HealthStatus::Degraded, HealthStatus::Unhealthy, HealthStatus::Unhealthy])]
#[case(vec![HealthStatus::Degraded, HealthStatus::Healthy, HealthStatus::Healthy, HealthStatus::Healthy])]
#[case(vec![HealthStatus::Unhealthy, HealthStatus::Degraded, HealthStatus::Degraded, HealthStatus::Healthy, HealthStatus::Healthy])]
fn test_reduction_is_order_independent(#[case] statuses: Vec<HealthStatus>) {
    let expected = reduce_status(&statuses);
    for permutation in permutations(&statuses) {
        assert_eq!(reduce_status(&permutation), expected, "{permutation:?}");
    }
}

#[rstest]
#[tokio::test]
async fn test_target_order_does_not_change_report() {
    let mut targets = standard_targets(4);
    let forward = TestGateway::new(create_test_gateway_config_for(targets.clone())).await;
    targets.reverse();
    let reversed = TestGateway::new(create_test_gateway_config_for(targets)).await;

    for gateway in [&forward, &reversed] {
        gateway.serve("svc-0", Behaviour::Healthy);
        gateway.serve("svc-1", Behaviour::Fail);
        gateway.serve("svc-2", Behaviour::Healthy);
        gateway.serve("svc-3", Behaviour::Healthy);
    }

    let a = forward.aggregator.check_all().await;
    let b = reversed.aggregator.check_all().await;
    assert_eq!(a.status, b.status);
    assert_eq!(
        a.services.keys().collect::<Vec<_>>(),
        b.services.keys().collect::<Vec<_>>()
    );
}

#[rstest]
#[tokio::test]
async fn test_reply_status_mapping() {
    let gateway = TestGateway::new(create_test_gateway_config()).await;
    gateway.serve(
        "auth",
        Behaviour::Reply(json!({"status": "degraded", "message": "replica lag", "lagMs": 900})),
    );
    gateway.serve("billing", Behaviour::Reply(json!({"status": "maintenance"})));
    gateway.serve("deploy", Behaviour::Reply(json!({"status": "unhealthy"})));
    gateway.serve("monitor", Behaviour::Reply(json!({"version": "1.4.2"})));

    let report = gateway.aggregator.check_all().await;

    let auth = &report.services["auth"];
    assert_eq!(auth.status, HealthStatus::Degraded);
    assert_eq!(auth.metadata.error.as_deref(), Some("replica lag"));
    assert_eq!(auth.metadata.details.as_ref().map(|d| d["lagMs"].clone()), Some(json!(900)));

    // An answer with an unknown status still means the service is up
    assert_eq!(report.services["billing"].status, HealthStatus::Healthy);
    assert!(report.services["billing"].metadata.error.is_none());

    let deploy = &report.services["deploy"];
    assert_eq!(deploy.status, HealthStatus::Unhealthy);
    assert_eq!(deploy.metadata.error.as_deref(), Some("service reported unhealthy"));

    let monitor = &report.services["monitor"];
    assert_eq!(monitor.status, HealthStatus::Healthy);
    assert_eq!(monitor.metadata.details, Some(json!({"version": "1.4.2"})));

    // 1 degraded, 1 unhealthy of 4
    assert_eq!(report.status, HealthStatus::Degraded);

    // Answers are breaker successes whatever they report
    assert_eq!(gateway.aggregator.breakers().get_state("deploy").counts.failures, 0);
}

#[rstest]
#[tokio::test]
async fn test_circuit_debug_info_and_recommendations() {
    let mut config = create_test_gateway_config();
    config.circuit_breaker = hair_trigger();
    let gateway = TestGateway::new(config).await;
    gateway.serve_all_healthy();
    gateway.serve("billing", Behaviour::Fail);

    assert_eq!(
        gateway.aggregator.get_recommendations(),
        vec!["All circuits are healthy; no action needed".to_string()]
    );

    gateway.aggregator.check_all().await;

    let info = gateway.aggregator.get_circuit_debug_info();
    assert_eq!(info.summary.open, 1);
    assert_eq!(info.summary.half_open, 0);
    assert_eq!(info.summary.closed, 3);
    assert_eq!(info.services["billing"].state, CircuitState::Open);

    let json = serde_json::to_value(&info).expect("serialize");
    assert_eq!(json["summary"]["halfOpen"], 0);
    assert_eq!(json["services"]["billing"]["state"], "open");

    let recommendations = gateway.aggregator.get_recommendations();
    assert_eq!(recommendations.len(), 1);
    assert!(recommendations[0].starts_with("billing has been OPEN for"));
    assert!(recommendations[0].contains("consider investigating"));
}

#[rstest]
#[tokio::test]
async fn test_timeout_debug_info_lists_services() {
    let gateway = TestGateway::new(create_test_gateway_config()).await;
    let info = gateway.aggregator.get_timeout_debug_info();

    assert_eq!(info.floor_ms, 500);
    assert_eq!(info.services.len(), 4);
    assert_eq!(info.services["auth"].timeouts["health_check"], 500);
    assert_eq!(info.services["billing"].timeouts["health_check"], 1_000);
}

#[rstest]
#[tokio::test]
async fn test_reset_unknown_target_is_reported() {
    let gateway = TestGateway::new(create_test_gateway_config()).await;

    let outcome = gateway.aggregator.reset_circuit("ledger");
    assert!(!outcome.success);
    assert_eq!(outcome.message, "Unknown service: ledger");
    assert_eq!(outcome.reset_count, 0);
}

#[rstest]
#[tokio::test]
async fn test_reset_closed_target_is_noop() {
    let gateway = TestGateway::new(create_test_gateway_config()).await;
    gateway.serve_all_healthy();
    gateway.aggregator.check_all().await;

    let outcome = gateway.aggregator.reset_circuit("auth");
    assert!(outcome.success);
    assert!(outcome.message.contains("already closed"));
    assert_eq!(gateway.aggregator.breakers().state_of("auth"), CircuitState::Closed);
}

#[rstest]
#[tokio::test]
async fn test_reset_reopens_traffic() {
    let mut config = create_test_gateway_config();
    config.circuit_breaker = hair_trigger();
    let gateway = TestGateway::new(config).await;
    let deploy = gateway.serve("deploy", Behaviour::Fail);

    gateway.aggregator.check_all().await;
    assert_eq!(gateway.aggregator.breakers().state_of("deploy"), CircuitState::Open);

    let outcome = gateway.aggregator.reset_circuit("deploy");
    assert!(outcome.success);
    assert_eq!(outcome.reset_count, 1);
    assert_eq!(gateway.aggregator.breakers().state_of("deploy"), CircuitState::Closed);

    let report = gateway.aggregator.check_all().await;
    assert!(!report.services["deploy"].is_circuit_derived());
    assert_eq!(deploy.calls(), 2);
}
