use anyhow::{Context, Result};
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;

use multichat::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables and initialize logging
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting multichat v{}", multichat::VERSION);

    // Optional config file as the first argument, otherwise MULTICHAT_CONFIG
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match AggregatorConfig::load(config_path.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e).context("Failed to load configuration");
        }
    };

    let bus = EventBus::new(config.bus.capacity);
    let factory = Arc::new(DefaultAdapterFactory::new(Arc::clone(&config))?);
    let orchestrator = SessionOrchestrator::new(bus, factory, config.session.teardown_timeout());

    let server = WebServer::new(Arc::clone(&config), Arc::clone(&orchestrator));
    let result = server
        .start_server(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested");
        })
        .await;

    orchestrator.shutdown().await;
    info!("multichat stopped");
    result
}
