//! API Gateway - Main Entry Point

use anyhow::Result;
use clap::{Arg, Command};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_gateway::{ApiGatewayServer, BrokerHandles, GatewayConfig};
use services_common::LocalBroker;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "api_gateway=info,services_common=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse command line arguments
    let matches = Command::new("api-gateway")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Platform Team")
        .about("Ingress gateway: rate limiting, health aggregation and circuit administration")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("gateway.toml"),
        )
        .arg(
            Arg::new("routes")
                .long("routes")
                .help("Print available routes and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("demo")
                .long("demo")
                .help("Serve every configured service with an in-process demo responder")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    // Print routes if requested
    if matches.get_flag("routes") {
        api_gateway::server::print_routes();
        return Ok(());
    }

    // Load configuration
    let default_config = "gateway.toml".to_string();
    let config_path = matches
        .get_one::<String>("config")
        .unwrap_or(&default_config);
    let config = match GatewayConfig::from_file(config_path) {
        Ok(config) => {
            info!("Loaded configuration from: {}", config_path);
            config
        }
        Err(e) => {
            error!("Failed to load config from {}: {}", config_path, e);
            info!("Using default configuration");
            GatewayConfig::default()
        }
    };

    info!(
        "Starting API Gateway v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!("Server will bind to: {}", config.server_address());
    info!("Environment: {}", config.deployment_environment());
    info!("Services:");
    for target in &config.services {
        info!("  {} ({}) via {}", target.name, target.tier, target.exchange);
    }
    info!("Features enabled:");
    info!("  Rate Limiting: {}", config.rate_limiting.enabled);
    info!("  Metrics: {}", config.monitoring.metrics_enabled);
    info!("  Compression: {}", config.server.compression);

    // The broker transport is in-process; a networked adapter plugs in through BrokerHandles
    let broker = Arc::new(LocalBroker::new("api-gateway"));
    let demo = matches.get_flag("demo");

    let server = match ApiGatewayServer::new(config.clone(), BrokerHandles::local(Arc::clone(&broker))).await {
        Ok(server) => server,
        Err(e) => {
            error!("Startup failed: {:#}", e);
            std::process::exit(1);
        }
    };

    if demo {
        if let Err(e) = api_gateway::demo::register_demo_responders(&broker, &config.services) {
            error!("Failed to register demo responders: {:#}", e);
            std::process::exit(1);
        }
    }

    // Start the server
    if let Err(e) = server.start().await {
        error!("Server error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
