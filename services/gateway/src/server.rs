//! API Gateway server implementation

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, FromRef},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use services_common::{
    CircuitBreakerEngine, EventSink, LocalBroker, RequestChannel, RpcClient, TimeoutResolver,
    TopologyChannel, TopologyConfig, TopologyManager, TopologyReport,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::{compression::CompressionLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::{
    config::GatewayConfig,
    handlers::{AdminHandlers, HealthHandlers},
    health::HealthAggregator,
    middleware::{RateLimitPolicy, RateLimitState, logging_middleware, rate_limit_middleware},
    models::ApiResponse,
    rate_limiter::{RateLimiter, RedisRateLimitStore},
};

/// Broker capabilities the gateway consumes
#[derive(Clone)]
pub struct BrokerHandles {
    pub requests: Arc<dyn RequestChannel>,
    pub events: Arc<dyn EventSink>,
    pub topology: Arc<dyn TopologyChannel>,
}

impl std::fmt::Debug for BrokerHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerHandles").finish_non_exhaustive()
    }
}

impl BrokerHandles {
    /// All three roles served by one in-process broker
    #[must_use]
    pub fn local(broker: Arc<LocalBroker>) -> Self {
        Self {
            requests: broker.clone(),
            events: broker.clone(),
            topology: broker,
        }
    }
}

/// Unified application state containing all handlers
#[derive(Clone, Debug, FromRef)]
pub struct AppState {
    pub health: HealthHandlers,
    pub admin: AdminHandlers,
}

/// API Gateway server
#[derive(Debug)]
pub struct ApiGatewayServer {
    config: GatewayConfig,
    aggregator: HealthAggregator,
    rate_limit: Option<RateLimitState>,
}

impl ApiGatewayServer {
    /// Declare the broker topology and wire every component
    ///
    /// Fails when the topology cannot be established; the gateway must not
    /// serve against a broker it cannot guarantee.
    pub async fn new(config: GatewayConfig, broker: BrokerHandles) -> Result<Self> {
        info!("Initializing API Gateway server");

        config.validate().context("Invalid gateway configuration")?;

        let report = apply_topology(&config, Arc::clone(&broker.topology)).await?;
        info!(declarations = report.applied.len(), "Broker topology established");

        let aggregator = build_aggregator(&config, &broker);
        let rate_limit = build_rate_limit(&config)?;

        #[cfg(feature = "monitoring")]
        if config.monitoring.metrics_enabled {
            if let Err(e) = crate::metrics::init_metrics() {
                warn!(error = %e, "Metrics exporter unavailable");
            }
        }

        info!("API Gateway server initialized successfully");

        Ok(Self {
            config,
            aggregator,
            rate_limit,
        })
    }

    #[must_use]
    pub fn aggregator(&self) -> &HealthAggregator {
        &self.aggregator
    }

    /// The Axum application with all routes and middleware
    #[must_use]
    pub fn router(&self) -> Router {
        router(&self.config, self.aggregator.clone(), self.rate_limit.clone())
    }

    /// Start the server
    pub async fn start(self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .server_address()
            .parse()
            .with_context(|| format!("Invalid server address '{}'", self.config.server_address()))?;

        let app = self.router();

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                info!("TCP listener bound successfully to {}", addr);
                listener
            }
            Err(e) => {
                error!("Failed to bind TCP listener to {}: {}", addr, e);
                return Err(anyhow!("Failed to bind to address {}: {}", addr, e));
            }
        };

        let service = app.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(listener, service).await {
            error!("Server encountered a fatal error: {}", e);
            return Err(anyhow!("Server error: {}", e));
        }

        Ok(())
    }
}

/// Apply the default topology for the configured services
pub async fn apply_topology(
    config: &GatewayConfig,
    channel: Arc<dyn TopologyChannel>,
) -> Result<TopologyReport> {
    let topology = TopologyConfig::for_targets(&config.services);
    let manager = TopologyManager::new(channel);

    match manager.apply_topology(&topology).await {
        Ok(report) => Ok(report),
        Err(e) => {
            for declaration in e.applied() {
                error!(declaration = %declaration, "Declared before topology failure");
            }
            error!(error = %e, "Broker topology could not be established");
            Err(anyhow::Error::new(e).context("Broker topology setup failed"))
        }
    }
}

/// Resolver, breaker engine, RPC client and aggregator for the configured services
#[must_use]
pub fn build_aggregator(config: &GatewayConfig, broker: &BrokerHandles) -> HealthAggregator {
    let timeouts = Arc::new(TimeoutResolver::new(
        config.timeouts.clone(),
        config.deployment_environment(),
        &config.services,
    ));
    let breakers = Arc::new(
        CircuitBreakerEngine::new(config.circuit_breaker.clone())
            .with_event_sink(Arc::clone(&broker.events)),
    );
    let client = RpcClient::new(Arc::clone(&broker.requests), breakers, timeouts)
        .with_retry_policy(config.rpc.clone());

    HealthAggregator::new(client, config.services.clone())
}

/// Rate limit middleware state, `None` when rate limiting is disabled
pub fn build_rate_limit(config: &GatewayConfig) -> Result<Option<RateLimitState>> {
    let settings = &config.rate_limiting;
    if !settings.enabled {
        info!("Rate limiting disabled");
        return Ok(None);
    }

    let policy = RateLimitPolicy::from_config(settings);
    policy.options.validate()?;

    let limiter = match &settings.redis_url {
        Some(url) => {
            let store = RedisRateLimitStore::new(url).context("Invalid rate limit store URL")?;
            RateLimiter::new(Arc::new(store), settings.key_prefix.clone())
        }
        None => {
            warn!("No rate limit store configured, limits are local to this process");
            RateLimiter::in_memory(settings.key_prefix.clone())
        }
    };
    info!(
        store = limiter.store_name(),
        limit = policy.options.limit,
        burst = policy.options.burst,
        window_seconds = policy.options.window_seconds,
        key_strategy = %policy.strategy,
        "Rate limiting enabled"
    );

    Ok(Some(RateLimitState {
        limiter: Arc::new(limiter),
        policy: Arc::new(policy),
    }))
}

/// Build the router; middleware is composed here from plain config
pub fn router(
    config: &GatewayConfig,
    aggregator: HealthAggregator,
    rate_limit: Option<RateLimitState>,
) -> Router {
    let state = AppState {
        health: HealthHandlers::new(aggregator.clone()),
        admin: AdminHandlers::new(aggregator),
    };
    let health_path = config.monitoring.health_path.trim_end_matches('/');

    let mut app = Router::new()
        .route(health_path, get(HealthHandlers::health_check))
        .route(&format!("{health_path}/ready"), get(HealthHandlers::readiness))
        .route(
            &format!("{health_path}/circuit-breakers"),
            get(HealthHandlers::circuit_breakers),
        )
        .route(
            &format!("{health_path}/recommendations"),
            get(HealthHandlers::recommendations),
        )
        .route(&format!("{health_path}/timeouts"), get(HealthHandlers::timeouts))
        .route(
            "/admin/circuit-breaker/reset/:service_name",
            post(AdminHandlers::reset_circuit),
        );

    if config.monitoring.metrics_enabled {
        app = app.route(&config.monitoring.metrics_path, get(HealthHandlers::metrics));
    }

    let mut app = app
        .fallback(not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.server.max_body_size))
        .layer(TimeoutLayer::new(Duration::from_secs(config.server.timeout_seconds)));

    if let Some(rate_limit) = rate_limit {
        app = app.layer(middleware::from_fn_with_state(rate_limit, rate_limit_middleware));
    }

    let app = app
        .layer(middleware::from_fn(logging_middleware))
        .layer(TraceLayer::new_for_http());

    if config.server.compression {
        app.layer(CompressionLayer::new())
    } else {
        app
    }
}

async fn not_found() -> impl IntoResponse {
    let error = crate::middleware::create_error_response("not_found", "No such route", None);
    (StatusCode::NOT_FOUND, Json(ApiResponse::<()>::error(error)))
}

/// API route documentation
pub fn print_routes() {
    println!("API Gateway Routes:");
    println!("===================");
    println!();
    println!("Health & Monitoring:");
    println!("  GET  /health                    - Aggregated system health");
    println!("  GET  /health/ready              - Readiness, no downstream calls");
    println!("  GET  /health/circuit-breakers   - Circuit breaker summary");
    println!("  GET  /health/recommendations    - Operator recommendations");
    println!("  GET  /health/timeouts           - Resolved deadlines per service");
    println!("  GET  /metrics                   - Prometheus metrics");
    println!();
    println!("Administration:");
    println!("  POST /admin/circuit-breaker/reset/:serviceName - Force a circuit closed");
    println!();
    println!("All endpoints support:");
    println!("- Rate limiting (except readiness and metrics)");
    println!("- Compression");
    println!("- Request tracing");
}
