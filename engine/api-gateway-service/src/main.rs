//! ApiGateway Production Service
//!
//! Entry point for the authenticated local API. Loads configuration, sets up
//! logging and metrics, runs the gateway and shuts it down on SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use api_gateway_service::{
    graceful_shutdown, initialize_logging, load_configuration, setup_signal_handlers, ServiceState,
};

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "api-gateway", version, about = "Authenticated HTTP/WebSocket access gateway")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "API_GATEWAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = load_configuration(args.config.as_deref()).context("Failed to load configuration")?;

    // Initialize logging; the guard flushes file output on exit
    let _log_guard = initialize_logging(&config.logging)?;
    info!("Starting ApiGateway Service v{}", env!("CARGO_PKG_VERSION"));

    // Create service state
    let service_state = Arc::new(ServiceState::new(config)?);
    service_state.install_metrics_exporter()?;
    info!("Service state initialized");

    // Setup signal handlers for graceful shutdown
    let mut shutdown_signal = setup_signal_handlers()?;
    info!("Signal handlers configured");

    let janitor_handle = service_state.start_session_janitor();

    // Start the ApiGateway in a separate task
    info!("Starting ApiGateway...");
    let gateway_handle = {
        let state = service_state.clone();
        tokio::spawn(async move {
            if let Err(e) = state.start_gateway().await {
                error!("ApiGateway failed: {:#}", e);
            }
        })
    };

    // Wait for shutdown signal
    info!("ApiGateway Service is running. Press Ctrl+C to shutdown gracefully.");
    let _ = shutdown_signal.recv().await;

    // Graceful shutdown
    info!("Shutdown signal received. Initiating graceful shutdown...");
    graceful_shutdown(service_state, gateway_handle, janitor_handle).await?;

    info!("ApiGateway Service shutdown complete");
    Ok(())
}
