//! WebSocket connection handler for the ApiGateway

use crate::error::{AuthError, GatewayError, GatewayResult};
use crate::gateway::wait_for_stop;
use crate::subscription::{Connection, SubscriptionService};
use crate::ws_handshake::{ConnectionState, HandshakeFilter};

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

/// How long queued frames, the close frame included, may take to flush
const SENDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Handles one WebSocket connection from handshake to close
pub struct WebSocketHandler {
    /// Connection state, authenticated during the handshake
    state: ConnectionState,

    /// Upgrade authentication
    handshake: Arc<HandshakeFilter>,

    /// Subscription routing
    subscriptions: Arc<SubscriptionService>,

    /// Send detailed reasons in handshake rejections
    expose_failure_reason: bool,

    /// Frames buffered between the subscriber lanes and the socket
    outbound_capacity: usize,

    /// Flips to `true` when the gateway stops
    shutdown: watch::Receiver<bool>,
}

impl WebSocketHandler {
    pub fn new(
        peer_addr: SocketAddr,
        handshake: Arc<HandshakeFilter>,
        subscriptions: Arc<SubscriptionService>,
        expose_failure_reason: bool,
        outbound_capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state: ConnectionState::new(peer_addr),
            handshake,
            subscriptions,
            expose_failure_reason,
            outbound_capacity,
            shutdown,
        }
    }

    /// Handle the WebSocket connection
    pub async fn handle(self, stream: TcpStream) -> GatewayResult<()> {
        let peer_addr = self.state.peer_addr();
        debug!("Handling WebSocket connection {} from {}", self.state.id(), peer_addr);

        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            self.handshake
                .filter(Some(&self.state), request)
                .map(|_| response)
                .map_err(|rejection| rejection.into_error_response(self.expose_failure_reason))
        };
        let ws_stream = accept_hdr_async(stream, callback).await?;

        // Only an upgrade that went through the filter may carry traffic
        let Some(session) = self.state.session() else {
            warn!("Closing unauthenticated WebSocket connection from {}", peer_addr);
            return Err(GatewayError::Authentication(AuthError::InvalidSession));
        };
        info!("WebSocket connection {} opened for client {}", self.state.id(), session.client_id);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<WsMessage>(self.outbound_capacity.max(1));
        let connection = Connection::new(self.state.id(), tx.clone());

        let sender_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = ws_sender.send(message).await {
                    error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        let mut shutdown = self.shutdown.clone();
        loop {
            let message = tokio::select! {
                message = ws_receiver.next() => message,
                _ = wait_for_stop(&mut shutdown) => {
                    debug!("Gateway stopping, closing connection {}", self.state.id());
                    let _ = tx.try_send(WsMessage::Close(None));
                    break;
                }
            };
            let Some(message) = message else {
                break;
            };

            match message {
                Ok(WsMessage::Text(text)) => {
                    self.subscriptions.on_message(&text, &connection);
                }
                Ok(WsMessage::Binary(_)) => {
                    debug!("Ignoring binary message from {}", peer_addr);
                }
                Ok(WsMessage::Ping(data)) => match tx.try_send(WsMessage::Pong(data)) {
                    Ok(()) | Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Closed(_)) => break,
                },
                Ok(WsMessage::Pong(_)) | Ok(WsMessage::Frame(_)) => {}
                Ok(WsMessage::Close(_)) => {
                    debug!("Received close message from {}", peer_addr);
                    break;
                }
                Err(e) => {
                    warn!("WebSocket error from {}: {}", peer_addr, e);
                    break;
                }
            }
        }

        self.subscriptions.on_connection_closed(self.state.id());

        // The sender task ends once every lane has let go of the outbound channel
        drop(connection);
        drop(tx);
        let abort = sender_task.abort_handle();
        if tokio::time::timeout(SENDER_DRAIN_TIMEOUT, sender_task).await.is_err() {
            abort.abort();
        }

        info!("WebSocket connection {} from {} closed", self.state.id(), peer_addr);
        Ok(())
    }
}
