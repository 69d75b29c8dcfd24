//! Warp filters that authenticate HTTP requests
//!
//! [`AuthFilters::signed`] reads the body through the bounded accumulator,
//! hashes it, verifies the signed headers and hands the consumed bytes on to
//! the route. [`AuthFilters::session_only`] checks `Client-Id` and
//! `Session-Id`. Both reject with [`AuthRejection`], which
//! [`handle_rejection`] turns into a 401, or a 413 for an oversize body.

use crate::auth::{AuthMode, AuthenticatedSession, SessionOnlyAuthenticator, SignedRequest, SignedRequestAuthenticator};
use crate::canonical::BodyAccumulator;
use crate::config::AuthConfig;
use crate::endpoint_policy::EndpointForbidden;
use crate::error::{AuthError, AuthErrorKind};
use bytes::{Buf, Bytes};
use futures_util::{Stream, StreamExt};
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, Method, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use warp::path::FullPath;
use warp::{Filter, Rejection, Reply};

const UNAUTHORIZED: &str = "Unauthorized";

/// Caller identity attached to an authenticated request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    pub session_id: String,
    pub client_id: String,
    pub mode: AuthMode,
}

impl RequestIdentity {
    fn new(session: AuthenticatedSession, mode: AuthMode) -> Self {
        Self { session_id: session.session_id, client_id: session.client_id, mode }
    }
}

/// Authentication failure surfaced to warp
#[derive(Debug)]
pub struct AuthRejection {
    pub status: StatusCode,
    pub public_message: String,
}

impl warp::reject::Reject for AuthRejection {}

/// Error body returned to clients
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
    pub timestamp: String,
}

/// Error detail
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail { code: code.to_string(), message: message.into() },
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Shared state behind the authentication filters
#[derive(Clone)]
pub struct AuthFilters {
    signed: Arc<SignedRequestAuthenticator>,
    session: Arc<SessionOnlyAuthenticator>,
    max_body_bytes: usize,
    expose_failure_reason: bool,
}

impl AuthFilters {
    pub fn new(
        signed: Arc<SignedRequestAuthenticator>,
        session: Arc<SessionOnlyAuthenticator>,
        config: &AuthConfig,
    ) -> Self {
        Self {
            signed,
            session,
            max_body_bytes: config.max_body_bytes,
            expose_failure_reason: config.expose_failure_reason,
        }
    }

    /// Signed-mode filter extracting the caller and the consumed body
    pub fn signed(&self) -> impl Filter<Extract = (RequestIdentity, Bytes), Error = Rejection> + Clone {
        let filters = self.clone();
        warp::method()
            .and(warp::path::full())
            .and(optional_raw_query())
            .and(warp::header::headers_cloned())
            .and(warp::body::stream())
            .and_then(move |method: Method, path: FullPath, query: Option<String>, headers: HeaderMap, body| {
                let filters = filters.clone();
                async move { filters.authenticate_signed(method, path, query, headers, body).await }
            })
            .untuple_one()
    }

    /// Session-only filter
    pub fn session_only(&self) -> impl Filter<Extract = (RequestIdentity,), Error = Rejection> + Clone {
        let filters = self.clone();
        warp::header::optional::<String>(crate::CLIENT_ID_HEADER)
            .and(warp::header::optional::<String>(crate::SESSION_ID_HEADER))
            .and_then(move |client_id: Option<String>, session_id: Option<String>| {
                let filters = filters.clone();
                async move {
                    filters
                        .session
                        .authenticate(client_id.as_deref(), session_id.as_deref(), AuthMode::SessionOnly)
                        .map(|session| RequestIdentity::new(session, AuthMode::SessionOnly))
                        .map_err(|e| filters.reject(e))
                }
            })
    }

    async fn authenticate_signed<S, B>(
        &self,
        method: Method,
        path: FullPath,
        query: Option<String>,
        headers: HeaderMap,
        body: S,
    ) -> Result<(RequestIdentity, Bytes), Rejection>
    where
        S: Stream<Item = Result<B, warp::Error>>,
        B: Buf,
    {
        let declared = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        let digested = match read_body(body, declared, self.max_body_bytes).await {
            Ok(digested) => digested,
            Err(e) => {
                tracing::warn!("Rejected body for {} {}: {}", method, path.as_str(), e);
                crate::metrics::record_auth_failure(AuthMode::Signed, &e);
                return Err(self.reject(e));
            }
        };

        let request = SignedRequest {
            session_id: header_value(&headers, crate::SESSION_ID_HEADER),
            method: method.as_str().to_string(),
            path: path.as_str().to_string(),
            query,
            nonce: header_value(&headers, crate::NONCE_HEADER),
            timestamp: header_value(&headers, crate::TIMESTAMP_HEADER),
            signature: header_value(&headers, crate::SIGNATURE_HEADER),
            body_digest_hex: digested.digest_hex().map(str::to_string),
        };

        match self.signed.authenticate(&request) {
            Ok(session) => Ok((RequestIdentity::new(session, AuthMode::Signed), digested.into_body())),
            Err(e) => Err(self.reject(e)),
        }
    }

    fn reject(&self, error: AuthError) -> Rejection {
        // The body cap is public, so its reason is always sent
        let rejection = match error.kind() {
            AuthErrorKind::OversizeBody => {
                AuthRejection { status: StatusCode::PAYLOAD_TOO_LARGE, public_message: error.to_string() }
            }
            AuthErrorKind::MalformedInput | AuthErrorKind::Unauthenticated => AuthRejection {
                status: StatusCode::UNAUTHORIZED,
                public_message: if self.expose_failure_reason { error.to_string() } else { UNAUTHORIZED.to_string() },
            },
        };
        warp::reject::custom(rejection)
    }
}

async fn read_body<S, B>(
    body: S,
    declared: Option<u64>,
    max_bytes: usize,
) -> Result<crate::canonical::DigestedBody, AuthError>
where
    S: Stream<Item = Result<B, warp::Error>>,
    B: Buf,
{
    if declared == Some(0) {
        return Ok(Default::default());
    }

    let mut accumulator = BodyAccumulator::new(declared, max_bytes)?;
    futures_util::pin_mut!(body);
    while let Some(chunk) = body.next().await {
        let mut chunk = chunk.map_err(|e| AuthError::BodyRead(e.to_string()))?;
        while chunk.has_remaining() {
            let slice = chunk.chunk();
            let len = slice.len();
            accumulator.push(slice)?;
            chunk.advance(len);
        }
    }
    Ok(accumulator.finish())
}

fn optional_raw_query() -> impl Filter<Extract = (Option<String>,), Error = Infallible> + Clone {
    warp::query::raw()
        .map(Some)
        .or(warp::any().map(|| None))
        .unify()
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

/// Map rejections to JSON error responses
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, body) = if let Some(rejection) = err.find::<AuthRejection>() {
        let code = if rejection.status == StatusCode::PAYLOAD_TOO_LARGE { "PAYLOAD_TOO_LARGE" } else { "UNAUTHORIZED" };
        (rejection.status, ErrorResponse::new(code, rejection.public_message.clone()))
    } else if err.find::<EndpointForbidden>().is_some() {
        (StatusCode::FORBIDDEN, ErrorResponse::new("FORBIDDEN", "Endpoint not allowed"))
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, ErrorResponse::new("NOT_FOUND", "Not Found"))
    } else if let Some(forbidden) = err.find::<warp::cors::CorsForbidden>() {
        (StatusCode::FORBIDDEN, ErrorResponse::new("FORBIDDEN", forbidden.to_string()))
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, ErrorResponse::new("METHOD_NOT_ALLOWED", "Method Not Allowed"))
    } else {
        tracing::error!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::new("INTERNAL_ERROR", "Internal Server Error"))
    };

    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::canonical_message;
    use crate::auth::test_support::*;
    use sha2::{Digest, Sha256};

    fn filters(fixture: &Fixture, expose: bool) -> AuthFilters {
        let config = AuthConfig { expose_failure_reason: expose, max_body_bytes: 1024, ..AuthConfig::default() };
        AuthFilters::new(
            Arc::new(fixture.signed_authenticator()),
            Arc::new(fixture.session_authenticator()),
            &config,
        )
    }

    fn echo_route(
        filters: &AuthFilters,
    ) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
        filters
            .signed()
            .map(|identity: RequestIdentity, body: Bytes| {
                format!("{}:{}", identity.client_id, String::from_utf8_lossy(&body))
            })
            .recover(handle_rejection)
    }

    #[tokio::test]
    async fn test_signed_post_passes_body_through() {
        let fixture = Fixture::new();
        let route = echo_route(&filters(&fixture, false));

        let body = br#"{"amount":5}"#;
        let digest = hex::encode(Sha256::digest(body));
        let ts = NOW.to_string();
        let message = canonical_message("n1", &ts, "POST", "/api/offers?market=BTC", Some(&digest));

        let response = warp::test::request()
            .method("POST")
            .path("/api/offers/?market=BTC")
            .header("Session-Id", SESSION_ID)
            .header("Nonce", "n1")
            .header("Timestamp", ts.as_str())
            .header("Signature", fixture.sign(&message))
            .header("content-length", body.len().to_string())
            .body(body.to_vec())
            .reply(&route)
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), &format!("{}:{}", DEVICE_ID, r#"{"amount":5}"#));
    }

    #[tokio::test]
    async fn test_replay_and_uniform_body() {
        let fixture = Fixture::new();
        let route = echo_route(&filters(&fixture, false));
        let ts = NOW.to_string();
        let signature = fixture.sign(&canonical_message("n1", &ts, "GET", "/api/offers", None));

        let send = || {
            warp::test::request()
                .method("GET")
                .path("/api/offers")
                .header("Session-Id", SESSION_ID)
                .header("Nonce", "n1")
                .header("Timestamp", ts.as_str())
                .header("Signature", signature.as_str())
        };

        assert_eq!(send().reply(&route).await.status(), StatusCode::OK);

        let replay = send().reply(&route).await;
        assert_eq!(replay.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = serde_json::from_slice(replay.body()).unwrap();
        assert_eq!(body["error"]["message"], "Unauthorized");
    }

    #[tokio::test]
    async fn test_missing_header_reason_when_exposed() {
        let fixture = Fixture::new();
        let route = echo_route(&filters(&fixture, true));

        let response = warp::test::request()
            .method("GET")
            .path("/api/offers")
            .header("Session-Id", SESSION_ID)
            .reply(&route)
            .await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["error"]["message"], "Missing required field: Nonce");
    }

    #[tokio::test]
    async fn test_oversize_body_rejected() {
        let fixture = Fixture::new();
        // Reason hidden for auth failures, still sent for the size cap
        let route = echo_route(&filters(&fixture, false));

        let response = warp::test::request()
            .method("POST")
            .path("/api/offers")
            .header("content-length", "2048")
            .body(vec![1u8; 2048])
            .reply(&route)
            .await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["error"]["code"], "PAYLOAD_TOO_LARGE");
        assert_eq!(body["error"]["message"], "Request body exceeds 1024 bytes");
    }

    #[tokio::test]
    async fn test_session_only_filter() {
        let fixture = Fixture::new();
        let route = filters(&fixture, false)
            .session_only()
            .map(|identity: RequestIdentity| identity.session_id)
            .recover(handle_rejection);

        let ok = warp::test::request()
            .header("Client-Id", DEVICE_ID)
            .header("Session-Id", SESSION_ID)
            .reply(&route)
            .await;
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(ok.body(), SESSION_ID);

        let mismatch = warp::test::request()
            .header("Client-Id", "someone-else")
            .header("Session-Id", SESSION_ID)
            .reply(&route)
            .await;
        assert_eq!(mismatch.status(), StatusCode::UNAUTHORIZED);
    }
}
