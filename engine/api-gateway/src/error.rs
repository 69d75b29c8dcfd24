//! Error types for the ApiGateway

use thiserror::Error;

/// Reasons an authentication attempt is refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid timestamp")]
    InvalidTimestamp,

    #[error("Timestamp outside allowed skew")]
    TimestampSkew,

    #[error("Invalid session")]
    InvalidSession,

    #[error("Session expired")]
    SessionExpired,

    #[error("Session does not belong to client")]
    ClientMismatch,

    #[error("Unknown device")]
    UnknownDevice,

    #[error("Invalid base64 signature")]
    InvalidBase64Signature,

    #[error("Invalid request signature")]
    InvalidSignature,

    #[error("Nonce already used")]
    NonceAlreadyUsed,

    #[error("Request body exceeds {max} bytes")]
    BodyTooLarge { max: usize },

    #[error("Failed to read request body: {0}")]
    BodyRead(String),
}

/// Coarse classification of authentication failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    /// Bad encoding or a missing field; the client sent garbage
    MalformedInput,
    /// Well-formed but not authorized
    Unauthenticated,
    /// Body rejected before or during the bounded read
    OversizeBody,
}

impl AuthErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthErrorKind::MalformedInput => "malformed_input",
            AuthErrorKind::Unauthenticated => "unauthenticated",
            AuthErrorKind::OversizeBody => "oversize_body",
        }
    }
}

impl AuthError {
    /// Classify the failure
    pub fn kind(&self) -> AuthErrorKind {
        match self {
            AuthError::MissingField(_)
            | AuthError::InvalidTimestamp
            | AuthError::InvalidBase64Signature
            | AuthError::BodyRead(_) => AuthErrorKind::MalformedInput,
            AuthError::BodyTooLarge { .. } => AuthErrorKind::OversizeBody,
            AuthError::TimestampSkew
            | AuthError::InvalidSession
            | AuthError::SessionExpired
            | AuthError::ClientMismatch
            | AuthError::UnknownDevice
            | AuthError::InvalidSignature
            | AuthError::NonceAlreadyUsed => AuthErrorKind::Unauthenticated,
        }
    }

    /// Stable label used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            AuthError::MissingField(_) => "missing_field",
            AuthError::InvalidTimestamp => "invalid_timestamp",
            AuthError::TimestampSkew => "timestamp_skew",
            AuthError::InvalidSession => "invalid_session",
            AuthError::SessionExpired => "session_expired",
            AuthError::ClientMismatch => "client_mismatch",
            AuthError::UnknownDevice => "unknown_device",
            AuthError::InvalidBase64Signature => "invalid_base64_signature",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::NonceAlreadyUsed => "nonce_reused",
            AuthError::BodyTooLarge { .. } => "body_too_large",
            AuthError::BodyRead(_) => "body_read",
        }
    }
}

/// Errors that can occur in the ApiGateway
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("System error: {0}")]
    System(String),
}

impl From<String> for GatewayError {
    fn from(err: String) -> Self {
        GatewayError::System(err)
    }
}

/// Result type for ApiGateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;
