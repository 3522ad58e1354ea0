//! In-process responders standing in for downstream services
//!
//! Used by `--demo` so the gateway can run against the local broker without
//! any real service behind it.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use services_common::{Envelope, LocalBroker, RequestHandler, ServiceTarget};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Answers health probes as healthy and echoes every other request
#[derive(Debug)]
pub struct DemoResponder {
    service: String,
    started: Instant,
}

impl DemoResponder {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            started: Instant::now(),
        }
    }
}

#[async_trait]
impl RequestHandler for DemoResponder {
    async fn handle(&self, envelope: Envelope) -> Result<Value> {
        if envelope.payload.get("type").and_then(Value::as_str) == Some("health_check") {
            return Ok(json!({
                "status": "healthy",
                "service": self.service,
                "uptimeSeconds": self.started.elapsed().as_secs(),
            }));
        }

        Ok(json!({
            "service": self.service,
            "routingKey": envelope.routing_key,
            "echo": envelope.payload,
        }))
    }

    fn name(&self) -> &str {
        &self.service
    }
}

/// Register a demo responder on every target's request queue
///
/// Must run after the topology is applied.
pub fn register_demo_responders(broker: &LocalBroker, targets: &[ServiceTarget]) -> Result<()> {
    for target in targets {
        let queue = target.request_queue();
        broker.register_responder(&queue, Arc::new(DemoResponder::new(target.name.clone())))?;
        info!(service = %target.name, queue = %queue, "Demo responder registered");
    }
    Ok(())
}
