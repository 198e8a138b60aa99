use std::sync::Arc;

use tcpgate::config::Config;
use tcpgate::hook::LogHook;
use tcpgate::system::register_system_routes;
use tcpgate::{ConnManager, Router, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        name = %config.server.name,
        ip = %config.server.ip,
        port = config.server.port,
        max_connections = config.manager.max_connections,
        detection_timeout = config.manager.detection_timeout,
        "Starting tcpgate server"
    );

    let manager = Arc::new(ConnManager::new(config.manager)?);
    manager.set_hook(Some(Arc::new(LogHook)));

    let router = Arc::new(Router::new());
    register_system_routes(&router, &manager)?;

    let server = Server::new(config.server, manager, router)?;
    server.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    server.stop().await;
    Ok(())
}
