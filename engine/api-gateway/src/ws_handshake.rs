//! WebSocket upgrade authentication
//!
//! Runs once per connection during the handshake. The outcome is stored on
//! the [`ConnectionState`] created at accept time so it lives as long as the
//! socket, and a repeated invocation for the same handshake passes straight
//! through.

use crate::auth::{AuthMode, AuthenticatedSession, SessionOnlyAuthenticator};
use crate::endpoint_policy::EndpointPolicy;
use crate::error::AuthError;
use http::header::{CONNECTION, UPGRADE};
use http::{HeaderMap, Request, Response, StatusCode};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Per-connection state owned by the accepted socket
#[derive(Debug)]
pub struct ConnectionState {
    id: Uuid,
    peer_addr: SocketAddr,
    session: Mutex<Option<AuthenticatedSession>>,
}

impl ConnectionState {
    pub fn new(peer_addr: SocketAddr) -> Self {
        Self { id: Uuid::new_v4(), peer_addr, session: Mutex::new(None) }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Session established during the handshake
    pub fn session(&self) -> Option<AuthenticatedSession> {
        self.session.lock().clone()
    }
}

/// What the filter did with a handshake request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Not an upgrade request
    NotUpgrade,
    /// The connection was already authenticated
    AlreadyAuthenticated,
    Authenticated(AuthenticatedSession),
}

/// Handshake failure; every variant ends with the connection closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeRejection {
    /// Upgrade path refused by the endpoint lists
    Forbidden,
    Unauthorized(AuthError),
    /// No connection state to record the outcome on
    Internal,
}

impl HandshakeRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            HandshakeRejection::Forbidden => StatusCode::FORBIDDEN,
            HandshakeRejection::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            HandshakeRejection::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Response sent back instead of `101 Switching Protocols`
    pub fn into_error_response(self, expose_failure_reason: bool) -> Response<Option<String>> {
        let body = match &self {
            HandshakeRejection::Forbidden => "Forbidden".to_string(),
            HandshakeRejection::Unauthorized(e) if expose_failure_reason => e.to_string(),
            HandshakeRejection::Unauthorized(_) => "Unauthorized".to_string(),
            HandshakeRejection::Internal => "Internal Server Error".to_string(),
        };
        let mut response = Response::new(Some(body));
        *response.status_mut() = self.status();
        response
            .headers_mut()
            .insert(CONNECTION, http::HeaderValue::from_static("close"));
        response
    }
}

/// Authenticates WebSocket upgrades with the session-only protocol
pub struct HandshakeFilter {
    authenticator: Arc<SessionOnlyAuthenticator>,
    endpoints: Arc<EndpointPolicy>,
}

impl HandshakeFilter {
    pub fn new(authenticator: Arc<SessionOnlyAuthenticator>, endpoints: Arc<EndpointPolicy>) -> Self {
        Self { authenticator, endpoints }
    }

    pub fn filter<B>(
        &self,
        connection: Option<&ConnectionState>,
        request: &Request<B>,
    ) -> Result<HandshakeOutcome, HandshakeRejection> {
        if !is_websocket_upgrade(request.headers()) {
            return Ok(HandshakeOutcome::NotUpgrade);
        }

        if !self.endpoints.is_allowed(request.uri().path()) {
            warn!("WebSocket upgrade to {} refused by endpoint policy", request.uri().path());
            return Err(HandshakeRejection::Forbidden);
        }

        let connection = connection.ok_or_else(|| {
            error!("WebSocket handshake for {} arrived without connection state", request.uri());
            HandshakeRejection::Internal
        })?;

        // Held across the check and the store so a re-entrant call cannot authenticate twice
        let mut session = connection.session.lock();
        if session.is_some() {
            debug!("Connection {} already authenticated, passing handshake through", connection.id);
            return Ok(HandshakeOutcome::AlreadyAuthenticated);
        }

        let headers = request.headers();
        match self.authenticator.authenticate(
            header_str(headers, crate::CLIENT_ID_HEADER),
            header_str(headers, crate::SESSION_ID_HEADER),
            AuthMode::WebSocket,
        ) {
            Ok(authenticated) => {
                debug!(
                    "Connection {} from {} authenticated as {}",
                    connection.id, connection.peer_addr, authenticated.client_id
                );
                *session = Some(authenticated.clone());
                Ok(HandshakeOutcome::Authenticated(authenticated))
            }
            Err(e) => {
                warn!("WebSocket handshake from {} rejected: {}", connection.peer_addr, e);
                Err(HandshakeRejection::Unauthorized(e))
            }
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `Upgrade: websocket` with a `Connection` header listing `upgrade`
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = header_str(headers, UPGRADE.as_str())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = header_str(headers, CONNECTION.as_str())
        .map(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    upgrade && connection
}
