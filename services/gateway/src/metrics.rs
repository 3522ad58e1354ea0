//! Prometheus metrics for API Gateway
//!
//! Metrics collection covering:
//! - HTTP request metrics (latency, status codes, throughput)
//! - Rate limiting decisions
//! - Health aggregation and per-service probe results

use anyhow::{Result, anyhow};
use chrono::Utc;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::health::HealthStatus;

/// Gateway metrics collector
#[derive(Debug)]
pub struct GatewayMetrics {
    start_time: AtomicI64,
}

impl GatewayMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::register_metrics();

        Self {
            start_time: AtomicI64::new(Utc::now().timestamp()),
        }
    }

    fn register_metrics() {
        // HTTP Request Metrics
        describe_counter!(
            "api_gateway_http_requests_total",
            "Total number of HTTP requests"
        );
        describe_histogram!(
            "api_gateway_http_request_duration_seconds",
            "HTTP request duration in seconds"
        );
        describe_counter!(
            "api_gateway_http_responses_total",
            "Total number of HTTP responses by status code"
        );

        // Rate Limiting Metrics
        describe_counter!(
            "api_gateway_rate_limit_exceeded_total",
            "Total rate limit violations"
        );
        describe_counter!(
            "api_gateway_rate_limit_store_errors_total",
            "Rate limit checks admitted because the store was unavailable"
        );

        // Health Metrics
        describe_histogram!(
            "api_gateway_health_check_duration_seconds",
            "Duration of a full health aggregation"
        );
        describe_gauge!(
            "api_gateway_system_health",
            "System health (2 healthy, 1 degraded, 0 unhealthy)"
        );
        describe_counter!(
            "api_gateway_health_probes_total",
            "Health probes by service and result"
        );

        // System Metrics
        describe_gauge!("api_gateway_uptime_seconds", "Gateway uptime in seconds");
    }

    /// Record HTTP request
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration: f64) {
        counter!("api_gateway_http_requests_total",
            "method" => method.to_string(),
            "path" => path.to_string()
        )
        .increment(1);

        histogram!("api_gateway_http_request_duration_seconds",
            "method" => method.to_string(),
            "path" => path.to_string()
        )
        .record(duration);

        counter!("api_gateway_http_responses_total",
            "status_code" => status.to_string()
        )
        .increment(1);
    }

    /// Record rate limit exceeded
    pub fn record_rate_limit_exceeded(&self, endpoint: &str) {
        counter!("api_gateway_rate_limit_exceeded_total",
            "endpoint" => endpoint.to_string()
        )
        .increment(1);
    }

    /// Record a completed health aggregation
    pub fn record_health_check(&self, status: HealthStatus, duration: f64) {
        histogram!("api_gateway_health_check_duration_seconds").record(duration);
        let level = match status {
            HealthStatus::Healthy => 2.0,
            HealthStatus::Degraded => 1.0,
            HealthStatus::Unhealthy => 0.0,
        };
        gauge!("api_gateway_system_health").set(level);
    }

    /// Record one service probe
    pub fn record_probe(&self, service: &str, status: HealthStatus) {
        counter!("api_gateway_health_probes_total",
            "service" => service.to_string(),
            "status" => status.as_str()
        )
        .increment(1);
    }

    /// Update system metrics
    pub fn update_system_metrics(&self) {
        let uptime = Utc::now().timestamp() - self.start_time.load(Ordering::Relaxed);
        // SAFETY: Uptime seconds safely converts to f64 for metrics
        #[allow(clippy::cast_precision_loss)]
        gauge!("api_gateway_uptime_seconds").set(uptime.max(0) as f64);
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
static METRICS: OnceLock<GatewayMetrics> = OnceLock::new();

/// Installed Prometheus recorder
static PROMETHEUS: OnceLock<PrometheusHandle> = OnceLock::new();

/// Get global metrics instance
pub fn get_metrics() -> &'static GatewayMetrics {
    METRICS.get_or_init(GatewayMetrics::new)
}

/// Install the Prometheus recorder and register metric descriptions
///
/// Safe to call more than once; later calls reuse the installed recorder.
pub fn init_metrics() -> Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS.get() {
        return Ok(handle);
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow!("Failed to install Prometheus recorder: {e}"))?;
    let handle = PROMETHEUS.get_or_init(|| handle);
    get_metrics();
    Ok(handle)
}

/// Render the Prometheus exposition text, if a recorder is installed
pub fn render() -> Option<String> {
    get_metrics().update_system_metrics();
    PROMETHEUS.get().map(PrometheusHandle::render)
}
