//! ApiGateway - authenticated access to the local HTTP/WebSocket API
//!
//! This crate guards the trading API exposed to paired devices. Every HTTP
//! request is authenticated either with a per-request signature bound to a
//! session and a device key, or with a session-only check for channels that
//! were already paired. WebSocket connections are authenticated once at
//! upgrade time and may then subscribe to topics, receiving a snapshot
//! followed by strictly sequenced incremental events.

pub mod auth;
pub mod canonical;
pub mod clock;
pub mod config;
pub mod endpoint_policy;
pub mod error;
pub mod gateway;
pub mod http_filter;
pub mod metrics;
pub mod nonce_store;
pub mod rest_api;
pub mod session;
pub mod subscription;
pub mod websocket_handler;
pub mod ws_handshake;

pub use auth::{AuthenticatedSession, SessionOnlyAuthenticator, SignedRequest, SignedRequestAuthenticator};
pub use config::GatewayConfig;
pub use error::{AuthError, GatewayError};
pub use gateway::ApiGateway;

/// Version of the ApiGateway
pub const VERSION: &str = "0.1.0";

/// Header carrying the session id (both modes)
pub const SESSION_ID_HEADER: &str = "Session-Id";

/// Header carrying the client id (session-only mode)
pub const CLIENT_ID_HEADER: &str = "Client-Id";

/// Header carrying the single-use request nonce (signed mode)
pub const NONCE_HEADER: &str = "Nonce";

/// Header carrying the request timestamp in epoch millis (signed mode)
pub const TIMESTAMP_HEADER: &str = "Timestamp";

/// Header carrying the base64 request signature (signed mode)
pub const SIGNATURE_HEADER: &str = "Signature";
