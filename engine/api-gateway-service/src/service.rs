//! Service state: wires the gateway to its in-process collaborators

use anyhow::{Context, Result};
use api_gateway::nonce_store::InMemoryNonceStore;
use api_gateway::session::{InMemoryPairingService, InMemorySessionService};
use api_gateway::ApiGateway;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ServiceConfig;

/// Everything the running service owns
pub struct ServiceState {
    pub config: ServiceConfig,
    pub sessions: Arc<InMemorySessionService>,
    pub pairing: Arc<InMemoryPairingService>,
    pub gateway: ApiGateway,
}

impl ServiceState {
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let sessions = Arc::new(InMemorySessionService::new(config.gateway.auth.session_ttl()));
        let pairing = Arc::new(InMemoryPairingService::new());
        let gateway = ApiGateway::new(
            config.gateway.clone(),
            sessions.clone(),
            pairing.clone(),
            Arc::new(InMemoryNonceStore::new()),
        );

        Ok(Self { config, sessions, pairing, gateway })
    }

    /// Install the Prometheus exporter if enabled
    pub fn install_metrics_exporter(&self) -> Result<()> {
        if !self.config.metrics.enabled {
            info!("Metrics exporter disabled");
            return Ok(());
        }

        let host: IpAddr = self
            .config
            .gateway
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::from([127, 0, 0, 1]));
        let addr = SocketAddr::new(host, self.config.metrics.port);
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .with_context(|| format!("Failed to install Prometheus exporter on {addr}"))?;

        info!("Prometheus metrics available on http://{}/metrics", addr);
        Ok(())
    }

    /// Run the gateway until it stops
    pub async fn start_gateway(&self) -> Result<()> {
        self.gateway.start().await.context("ApiGateway failed")
    }

    pub async fn stop_gateway(&self) -> Result<()> {
        self.gateway.stop().await.context("Failed to stop ApiGateway")
    }

    /// Periodically drop expired sessions
    pub fn start_session_janitor(&self) -> JoinHandle<()> {
        let sessions = self.sessions.clone();
        let period = Duration::from_secs(self.config.service.session_purge_interval_secs);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let purged = sessions.purge_expired(chrono::Utc::now().timestamp_millis());
                debug!("Session janitor pass purged {} sessions, {} live", purged, sessions.len());
            }
        })
    }
}
