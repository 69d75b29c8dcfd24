//! Signal handling for graceful shutdown

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::service::ServiceState;

/// Setup signal handlers for graceful shutdown; the receiver fires on the first signal
pub fn setup_signal_handlers() -> Result<mpsc::Receiver<()>> {
    let (shutdown_tx, shutdown_rx) = mpsc::channel(2);

    // Handle Ctrl+C (SIGINT)
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C signal: {}", e);
            return;
        }

        info!("Ctrl+C signal received");
        let _ = ctrl_c_tx.send(()).await;
    });

    // Handle SIGTERM (Unix only)
    #[cfg(unix)]
    {
        use signal_hook::consts::SIGTERM;
        use std::sync::atomic::{AtomicBool, Ordering};

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGTERM, shutdown_flag.clone())?;

        tokio::spawn(async move {
            loop {
                if shutdown_flag.load(Ordering::Relaxed) {
                    info!("SIGTERM signal received");
                    let _ = shutdown_tx.send(()).await;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
    }

    Ok(shutdown_rx)
}

/// Graceful shutdown handler
pub async fn graceful_shutdown(
    service_state: Arc<ServiceState>,
    gateway_handle: tokio::task::JoinHandle<()>,
    janitor_handle: tokio::task::JoinHandle<()>,
) -> Result<()> {
    info!("Starting graceful shutdown...");

    if let Err(e) = service_state.stop_gateway().await {
        error!("Failed to stop ApiGateway: {}", e);
    }
    janitor_handle.abort();

    // start() returns once both listeners have closed
    let shutdown_timeout = Duration::from_secs(service_state.config.service.shutdown_timeout_secs);
    let abort = gateway_handle.abort_handle();
    match timeout(shutdown_timeout, gateway_handle).await {
        Ok(Ok(())) => {
            info!("ApiGateway stopped gracefully");
        }
        Ok(Err(e)) if e.is_cancelled() => {}
        Ok(Err(e)) => {
            error!("ApiGateway task failed: {}", e);
        }
        Err(_) => {
            warn!("ApiGateway did not stop within timeout, forcing shutdown");
            abort.abort();
        }
    }

    info!(
        "Graceful shutdown complete ({} live sessions dropped)",
        service_state.sessions.len()
    );
    Ok(())
}
