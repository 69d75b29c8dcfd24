//! Main ApiGateway implementation

use crate::auth::{SessionOnlyAuthenticator, SignedRequestAuthenticator};
use crate::clock::{Clock, SystemClock};
use crate::config::GatewayConfig;
use crate::endpoint_policy::EndpointPolicy;
use crate::error::{GatewayError, GatewayResult};
use crate::http_filter::AuthFilters;
use crate::metrics;
use crate::nonce_store::NonceStore;
use crate::rest_api;
use crate::session::{PairingService, SessionService};
use crate::subscription::SubscriptionService;
use crate::websocket_handler::WebSocketHandler;
use crate::ws_handshake::HandshakeFilter;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};
use warp::{Filter, Reply};

/// HTTP and WebSocket front door of the local API
#[derive(Clone)]
pub struct ApiGateway {
    /// Gateway configuration
    config: GatewayConfig,

    /// Filters shared by the HTTP routes
    auth_filters: AuthFilters,

    /// Endpoint allow and deny lists
    endpoints: Arc<EndpointPolicy>,

    /// Upgrade authentication for WebSocket connections
    handshake: Arc<HandshakeFilter>,

    /// Topic subscriptions
    subscriptions: Arc<SubscriptionService>,

    /// Connection count
    connection_count: Arc<RwLock<usize>>,

    /// Running state
    is_running: Arc<RwLock<bool>>,

    /// Stop signal for the servers and every open connection
    shutdown: Arc<watch::Sender<bool>>,
}

impl ApiGateway {
    /// Create a new ApiGateway on the system clock
    pub fn new(
        config: GatewayConfig,
        sessions: Arc<dyn SessionService>,
        pairing: Arc<dyn PairingService>,
        nonces: Arc<dyn NonceStore>,
    ) -> Self {
        Self::with_clock(config, sessions, pairing, nonces, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: GatewayConfig,
        sessions: Arc<dyn SessionService>,
        pairing: Arc<dyn PairingService>,
        nonces: Arc<dyn NonceStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let signed = Arc::new(SignedRequestAuthenticator::with_clock(
            sessions.clone(),
            pairing,
            nonces,
            clock.clone(),
            &config.auth,
        ));
        let session_only = Arc::new(SessionOnlyAuthenticator::with_clock(sessions, clock));
        let auth_filters = AuthFilters::new(signed, session_only.clone(), &config.auth);
        let subscriptions = Arc::new(SubscriptionService::new(config.subscriptions.lane_capacity));
        let endpoints = Arc::new(EndpointPolicy::from_config(&config.server));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            auth_filters,
            handshake: Arc::new(HandshakeFilter::new(session_only, endpoints.clone())),
            endpoints,
            subscriptions,
            connection_count: Arc::new(RwLock::new(0)),
            is_running: Arc::new(RwLock::new(false)),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Subscription service, used by domain services to register their topics
    pub fn subscriptions(&self) -> Arc<SubscriptionService> {
        self.subscriptions.clone()
    }

    /// The HTTP routes, authentication included
    pub fn routes(&self) -> impl Filter<Extract = impl Reply, Error = std::convert::Infallible> + Clone {
        rest_api::create_routes(self.auth_filters.clone(), self.endpoints.clone())
    }

    /// Start both servers; returns once [`ApiGateway::stop`] has shut both down
    pub async fn start(&self) -> GatewayResult<()> {
        let http_addr = self
            .config
            .http_addr()
            .map_err(|e| GatewayError::Config(format!("Invalid HTTP address: {e}")))?;
        let websocket_addr = self
            .config
            .websocket_addr()
            .map_err(|e| GatewayError::Config(format!("Invalid WebSocket address: {e}")))?;

        info!("Starting ApiGateway (HTTP {}, WebSocket {})", http_addr, websocket_addr);

        let mut http_shutdown = self.shutdown.subscribe();
        let (bound_http_addr, http_server) = warp::serve(self.routes())
            .try_bind_with_graceful_shutdown(http_addr, async move { wait_for_stop(&mut http_shutdown).await })
            .map_err(|e| GatewayError::Config(format!("Failed to bind HTTP server on {http_addr}: {e}")))?;
        let http_task = tokio::spawn(http_server);
        info!("HTTP API listening on {}", bound_http_addr);

        let result = match TcpListener::bind(websocket_addr).await {
            Ok(listener) => self.serve_websocket(listener).await,
            Err(e) => {
                self.shutdown.send_replace(true);
                Err(e.into())
            }
        };

        if let Err(e) = http_task.await {
            error!("HTTP server task failed: {}", e);
        }
        info!("HTTP API stopped");
        result
    }

    /// Accept WebSocket connections from an already bound listener
    pub async fn serve_websocket(&self, listener: TcpListener) -> GatewayResult<()> {
        {
            let mut running = self.is_running.write().await;
            *running = true;
        }
        info!("WebSocket server listening on {}", listener.local_addr()?);

        let mut shutdown = self.shutdown.subscribe();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = wait_for_stop(&mut shutdown) => break,
            };
            match accepted {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = self.handle_connection(stream, peer_addr).await {
                        error!("Failed to handle connection from {}: {}", peer_addr, e);
                    }
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }

        *self.is_running.write().await = false;
        info!("WebSocket server stopped");
        Ok(())
    }

    /// Handle a new WebSocket connection
    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> GatewayResult<()> {
        {
            let mut count = self.connection_count.write().await;
            if *count >= self.config.server.max_connections {
                warn!("Connection limit reached, rejecting connection from {}", peer_addr);
                return Err(GatewayError::Connection("Connection limit exceeded".to_string()));
            }
            *count += 1;
        }
        metrics::record_connection_opened();

        let handler = WebSocketHandler::new(
            peer_addr,
            self.handshake.clone(),
            self.subscriptions.clone(),
            self.config.auth.expose_failure_reason,
            self.config.subscriptions.outbound_capacity,
            self.shutdown.subscribe(),
        );

        let connection_count = self.connection_count.clone();
        tokio::spawn(async move {
            if let Err(e) = handler.handle(stream).await {
                warn!("WebSocket connection from {} ended with error: {}", peer_addr, e);
            }

            let mut count = connection_count.write().await;
            *count = count.saturating_sub(1);
            metrics::record_connection_closed();
        });

        Ok(())
    }

    /// Stop both servers and close every open WebSocket connection.
    ///
    /// A stopped gateway stays stopped; a later `start` returns at once.
    pub async fn stop(&self) -> GatewayResult<()> {
        info!("Stopping ApiGateway...");
        *self.is_running.write().await = false;
        self.shutdown.send_replace(true);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// Get the number of active connections
    pub async fn connection_count(&self) -> usize {
        *self.connection_count.read().await
    }
}

/// Resolves once the gateway is stopped or dropped
pub(crate) async fn wait_for_stop(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
