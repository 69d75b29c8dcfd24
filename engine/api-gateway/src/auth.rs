//! Authentication module for the ApiGateway
//!
//! Two modes share the same session lookup:
//!
//! * [`SignedRequestAuthenticator`] binds method, path, query, body digest,
//!   nonce and timestamp to a session and verifies an Ed25519 signature made
//!   with the paired device's key. Nonces are single-use inside the retention
//!   window.
//! * [`SessionOnlyAuthenticator`] only checks that the session exists, has
//!   not expired and belongs to the presenting client. It is meant for
//!   channels whose establishment already proved key possession, such as
//!   local WebSocket upgrades.

use crate::canonical::normalize_path_and_query;
use crate::clock::{Clock, SystemClock};
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::metrics;
use crate::nonce_store::{nonce_key, NonceStore};
use crate::session::{PairingService, SessionService, SessionToken};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, VerifyingKey};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Version tag leading every canonical signed message
pub const PROTOCOL_VERSION: &str = "v1";

/// Which authentication path produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Signed,
    SessionOnly,
    WebSocket,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Signed => "signed",
            AuthMode::SessionOnly => "session_only",
            AuthMode::WebSocket => "websocket",
        }
    }
}

/// Identity established by a successful authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedSession {
    pub session_id: String,
    /// Device id in signed mode, client id in session-only mode
    pub client_id: String,
}

/// Everything the signed protocol needs from an inbound request
#[derive(Debug, Clone, Default)]
pub struct SignedRequest {
    pub session_id: Option<String>,
    pub method: String,
    /// Raw, still percent-encoded path
    pub path: String,
    /// Raw query string without the leading `?`
    pub query: Option<String>,
    pub nonce: Option<String>,
    pub timestamp: Option<String>,
    pub signature: Option<String>,
    pub body_digest_hex: Option<String>,
}

/// Build the exact message a client signs.
///
/// Fields are joined with `\n` in fixed order: version, nonce, timestamp,
/// upper-cased method, canonical path and query, body digest (or empty).
pub fn canonical_message(
    nonce: &str,
    timestamp: &str,
    method: &str,
    canonical_path_and_query: &str,
    body_digest_hex: Option<&str>,
) -> String {
    [
        PROTOCOL_VERSION,
        nonce,
        timestamp,
        &method.to_ascii_uppercase(),
        canonical_path_and_query,
        body_digest_hex.unwrap_or(""),
    ]
    .join("\n")
}

fn require<'a>(value: &'a Option<String>, field: &'static str) -> Result<&'a str, AuthError> {
    value.as_deref().filter(|v| !v.is_empty()).ok_or(AuthError::MissingField(field))
}

fn find_live_session(
    sessions: &dyn SessionService,
    session_id: &str,
    now_millis: i64,
) -> Result<SessionToken, AuthError> {
    let token = sessions.find(session_id).ok_or(AuthError::InvalidSession)?;
    if token.is_expired(now_millis) {
        return Err(AuthError::SessionExpired);
    }
    Ok(token)
}

/// Per-request signature authenticator
pub struct SignedRequestAuthenticator {
    sessions: Arc<dyn SessionService>,
    pairing: Arc<dyn PairingService>,
    nonces: Arc<dyn NonceStore>,
    clock: Arc<dyn Clock>,
    max_clock_skew: Duration,
    nonce_ttl: Duration,
}

impl SignedRequestAuthenticator {
    pub fn new(
        sessions: Arc<dyn SessionService>,
        pairing: Arc<dyn PairingService>,
        nonces: Arc<dyn NonceStore>,
        config: &AuthConfig,
    ) -> Self {
        Self::with_clock(sessions, pairing, nonces, Arc::new(SystemClock), config)
    }

    pub fn with_clock(
        sessions: Arc<dyn SessionService>,
        pairing: Arc<dyn PairingService>,
        nonces: Arc<dyn NonceStore>,
        clock: Arc<dyn Clock>,
        config: &AuthConfig,
    ) -> Self {
        Self {
            sessions,
            pairing,
            nonces,
            clock,
            max_clock_skew: config.max_clock_skew(),
            nonce_ttl: config.nonce_ttl(),
        }
    }

    /// Authenticate a signed request, logging and counting failures
    pub fn authenticate(&self, request: &SignedRequest) -> Result<AuthenticatedSession, AuthError> {
        match self.verify(request) {
            Ok(session) => {
                debug!(
                    "Authenticated signed request {} {} for session {}",
                    request.method, request.path, session.session_id
                );
                metrics::record_auth_success(AuthMode::Signed);
                Ok(session)
            }
            Err(e) => {
                warn!(
                    "Signed request {} {} rejected (session {:?}): {}",
                    request.method, request.path, request.session_id, e
                );
                metrics::record_auth_failure(AuthMode::Signed, &e);
                Err(e)
            }
        }
    }

    fn verify(&self, request: &SignedRequest) -> Result<AuthenticatedSession, AuthError> {
        let session_id = require(&request.session_id, crate::SESSION_ID_HEADER)?;
        let nonce = require(&request.nonce, crate::NONCE_HEADER)?;
        let timestamp = require(&request.timestamp, crate::TIMESTAMP_HEADER)?;
        let signature_base64 = require(&request.signature, crate::SIGNATURE_HEADER)?;

        let request_millis: i64 = timestamp.parse().map_err(|_| AuthError::InvalidTimestamp)?;
        let now = self.clock.now_millis();
        if now.abs_diff(request_millis) > self.max_clock_skew.as_millis() as u64 {
            return Err(AuthError::TimestampSkew);
        }

        let session = find_live_session(self.sessions.as_ref(), session_id, now)?;
        let device = self
            .pairing
            .find_device_profile(&session.device_id)
            .ok_or(AuthError::UnknownDevice)?;

        let path_and_query = normalize_path_and_query(&request.path, request.query.as_deref());
        let message = canonical_message(
            nonce,
            timestamp,
            &request.method,
            &path_and_query,
            request.body_digest_hex.as_deref(),
        );

        let signature_bytes =
            STANDARD.decode(signature_base64).map_err(|_| AuthError::InvalidBase64Signature)?;
        verify_signature(&device.public_key, message.as_bytes(), &signature_bytes)?;

        // Only a verified request may consume a nonce
        self.nonces.purge_older_than(now - self.nonce_ttl.as_millis() as i64);
        if !self.nonces.insert_if_absent(&nonce_key(session_id, nonce), now) {
            return Err(AuthError::NonceAlreadyUsed);
        }

        Ok(AuthenticatedSession {
            session_id: session.session_id,
            client_id: session.device_id,
        })
    }
}

fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<(), AuthError> {
    let key = VerifyingKey::from_bytes(public_key).map_err(|_| AuthError::InvalidSignature)?;
    let signature = Signature::from_slice(signature).map_err(|_| AuthError::InvalidSignature)?;
    key.verify_strict(message, &signature).map_err(|_| AuthError::InvalidSignature)
}

/// Session-only authenticator for pre-paired channels.
///
/// Never route network-exposed, unpaired entry points through this; it
/// performs no per-request proof of key possession.
pub struct SessionOnlyAuthenticator {
    sessions: Arc<dyn SessionService>,
    clock: Arc<dyn Clock>,
}

impl SessionOnlyAuthenticator {
    pub fn new(sessions: Arc<dyn SessionService>) -> Self {
        Self::with_clock(sessions, Arc::new(SystemClock))
    }

    pub fn with_clock(sessions: Arc<dyn SessionService>, clock: Arc<dyn Clock>) -> Self {
        Self { sessions, clock }
    }

    pub fn authenticate(
        &self,
        client_id: Option<&str>,
        session_id: Option<&str>,
        mode: AuthMode,
    ) -> Result<AuthenticatedSession, AuthError> {
        match self.verify(client_id, session_id) {
            Ok(session) => {
                debug!("Authenticated client {} on session {}", session.client_id, session.session_id);
                metrics::record_auth_success(mode);
                Ok(session)
            }
            Err(e) => {
                warn!("Session authentication rejected (client {:?}): {}", client_id, e);
                metrics::record_auth_failure(mode, &e);
                Err(e)
            }
        }
    }

    fn verify(
        &self,
        client_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<AuthenticatedSession, AuthError> {
        let client_id = client_id
            .filter(|v| !v.is_empty())
            .ok_or(AuthError::MissingField(crate::CLIENT_ID_HEADER))?;
        let session_id = session_id
            .filter(|v| !v.is_empty())
            .ok_or(AuthError::MissingField(crate::SESSION_ID_HEADER))?;

        let session = find_live_session(self.sessions.as_ref(), session_id, self.clock.now_millis())?;
        if session.device_id != client_id {
            return Err(AuthError::ClientMismatch);
        }

        Ok(AuthenticatedSession { session_id: session.session_id, client_id: client_id.to_string() })
    }
}
