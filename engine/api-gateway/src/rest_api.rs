//! REST API endpoints for the ApiGateway
//!
//! Resource handlers live in other services; the routes here expose the
//! authentication layer itself so clients can check their session and
//! their request signing.

use crate::endpoint_policy::{self, EndpointPolicy};
use crate::http_filter::{handle_rejection, AuthFilters, RequestIdentity};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use warp::{Filter, Reply};

/// Who the gateway thinks the caller is
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfoResponse {
    pub session_id: String,
    pub client_id: String,
    pub mode: String,
}

/// Echo of a signed request
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EchoResponse {
    pub session_id: String,
    pub client_id: String,
    pub body_length: usize,
    pub body: String,
}

fn session_info(identity: RequestIdentity) -> impl Reply {
    warp::reply::json(&SessionInfoResponse {
        session_id: identity.session_id,
        client_id: identity.client_id,
        mode: identity.mode.as_str().to_string(),
    })
}

fn echo(identity: RequestIdentity, body: Bytes) -> impl Reply {
    warp::reply::json(&EchoResponse {
        session_id: identity.session_id,
        client_id: identity.client_id,
        body_length: body.len(),
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

/// Create REST API routes behind the endpoint lists
pub fn create_routes(
    filters: AuthFilters,
    endpoints: Arc<EndpointPolicy>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    // Session check endpoint
    let session = warp::path!("api" / "v1" / "access" / "session")
        .and(warp::get())
        .and(filters.session_only())
        .map(session_info);

    // Signed echo endpoint, any method
    let signed_echo = warp::path!("api" / "v1" / "access" / "echo").and(filters.signed()).map(echo);

    // Health check endpoint
    let health = warp::path("health").and(warp::path::end()).and(warp::get()).map(|| {
        warp::reply::json(&serde_json::json!({
            "status": "healthy",
            "version": crate::VERSION,
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))
    });

    endpoint_policy::filter(endpoints)
        .and(health.or(session).or(signed_echo))
        .with(
            warp::cors()
                .allow_any_origin()
                .allow_headers(vec![
                    "content-type",
                    "session-id",
                    "client-id",
                    "nonce",
                    "timestamp",
                    "signature",
                ])
                .allow_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"]),
        )
        .recover(handle_rejection)
}
