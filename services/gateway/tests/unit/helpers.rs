//! Test helpers and utilities

use anyhow::{Result, bail};
use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
};
use serde_json::{Value, json};
use services_common::{Envelope, LocalBroker, RequestHandler, ServiceTarget, ServiceTier};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tower::ServiceExt;

use api_gateway::{
    GatewayConfig, HealthAggregator, server,
    server::BrokerHandles,
};

/// How a scripted service answers
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// `{"status": "healthy"}`
    Healthy,
    /// Arbitrary reply body
    Reply(Value),
    /// Handler error
    Fail,
    /// Healthy, after a delay
    Slow(Duration),
}

/// Downstream service stand-in that counts its calls
#[derive(Debug)]
pub struct ScriptedService {
    name: String,
    behaviour: Behaviour,
    calls: AtomicUsize,
}

impl ScriptedService {
    pub fn new(name: &str, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestHandler for ScriptedService {
    async fn handle(&self, _envelope: Envelope) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behaviour {
            Behaviour::Healthy => Ok(json!({"status": "healthy"})),
            Behaviour::Reply(body) => Ok(body.clone()),
            Behaviour::Fail => bail!("{} is down", self.name),
            Behaviour::Slow(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(json!({"status": "healthy"}))
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Aggregator wired to an in-process broker with the topology applied
pub struct TestGateway {
    pub config: GatewayConfig,
    pub broker: Arc<LocalBroker>,
    pub aggregator: HealthAggregator,
}

impl TestGateway {
    pub async fn new(config: GatewayConfig) -> Self {
        let broker = Arc::new(LocalBroker::new("gateway-tests"));
        let handles = BrokerHandles::local(Arc::clone(&broker));
        server::apply_topology(&config, Arc::clone(&handles.topology))
            .await
            .expect("topology");
        let aggregator = server::build_aggregator(&config, &handles);

        Self {
            config,
            broker,
            aggregator,
        }
    }

    /// Serve `target` with `behaviour`
    pub fn serve(&self, target: &str, behaviour: Behaviour) -> Arc<ScriptedService> {
        let service = ScriptedService::new(target, behaviour);
        self.broker
            .register_responder(&format!("{target}.requests"), service.clone())
            .expect("register responder");
        service
    }

    /// Serve every configured target as healthy
    pub fn serve_all_healthy(&self) {
        for target in self.config.services.clone() {
            self.serve(&target.name, Behaviour::Healthy);
        }
    }

    pub fn router(&self) -> Router {
        server::router(&self.config, self.aggregator.clone(), None)
    }
}

/// `n` standard-tier targets named `svc-<i>`
pub fn standard_targets(n: usize) -> Vec<ServiceTarget> {
    (0..n)
        .map(|i| ServiceTarget::new(format!("svc-{i}"), ServiceTier::Standard))
        .collect()
}

/// Send one request through the router and decode the JSON body
pub async fn send_json(app: Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, body)
}

pub async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    send_json(app, Method::GET, uri).await
}
