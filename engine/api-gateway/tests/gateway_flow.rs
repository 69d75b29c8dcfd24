//! End-to-end flows through the public ApiGateway surface

use api_gateway::auth::canonical_message;
use api_gateway::config::GatewayConfig;
use api_gateway::nonce_store::InMemoryNonceStore;
use api_gateway::session::{DeviceProfile, InMemoryPairingService, InMemorySessionService, SessionToken};
use api_gateway::subscription::{ModificationType, ServerMessage, SnapshotSource, Topic};
use api_gateway::ApiGateway;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use futures_util::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tungstenite::client::IntoClientRequest;
use tungstenite::Message;

const DEVICE_ID: &str = "phone-1";

struct Harness {
    gateway: ApiGateway,
    session: SessionToken,
    signing_key: SigningKey,
}

fn harness() -> Harness {
    harness_with(GatewayConfig::default())
}

fn harness_with(config: GatewayConfig) -> Harness {
    let sessions = Arc::new(InMemorySessionService::new(Duration::from_secs(3600)));
    let pairing = Arc::new(InMemoryPairingService::new());
    let signing_key = SigningKey::from_bytes(&[42u8; 32]);
    pairing.register_device(DeviceProfile {
        device_id: DEVICE_ID.to_string(),
        public_key: signing_key.verifying_key().to_bytes(),
    });
    let session = sessions.create_session(DEVICE_ID);

    let gateway = ApiGateway::new(
        config,
        sessions,
        pairing,
        Arc::new(InMemoryNonceStore::new()),
    );
    Harness { gateway, session, signing_key }
}

#[tokio::test]
async fn signed_post_then_replay() {
    let h = harness();
    let routes = h.gateway.routes();

    let body = br#"{"offerId":"o-1"}"#;
    let digest = hex::encode(Sha256::digest(body));
    let timestamp = chrono::Utc::now().timestamp_millis().to_string();
    let message = canonical_message("nonce-1", &timestamp, "POST", "/api/v1/access/echo", Some(&digest));
    let signature = STANDARD.encode(h.signing_key.sign(message.as_bytes()).to_bytes());

    let request = || {
        warp::test::request()
            .method("POST")
            .path("/api/v1/access/echo")
            .header("Session-Id", h.session.session_id.as_str())
            .header("Nonce", "nonce-1")
            .header("Timestamp", timestamp.as_str())
            .header("Signature", signature.as_str())
            .header("content-length", body.len().to_string())
            .body(body.to_vec())
    };

    let response = request().reply(&routes).await;
    assert_eq!(response.status(), 200);
    let echoed: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(echoed["clientId"], DEVICE_ID);
    assert_eq!(echoed["body"], r#"{"offerId":"o-1"}"#);

    let replay = request().reply(&routes).await;
    assert_eq!(replay.status(), 401);
    let rejected: serde_json::Value = serde_json::from_slice(replay.body()).unwrap();
    assert_eq!(rejected["error"]["message"], "Unauthorized");
}

struct OfferBook;

impl SnapshotSource for OfferBook {
    fn topic(&self) -> Topic {
        Topic::Offers
    }

    fn json_payload(&self, _parameter: Option<&str>) -> Option<String> {
        Some(r#"[{"id":"o-1"}]"#.to_string())
    }
}

async fn spawn_websocket_server(gateway: &ApiGateway) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let gateway = gateway.clone();
    tokio::spawn(async move { gateway.serve_websocket(listener).await });
    addr
}

fn client_request(addr: std::net::SocketAddr, session_id: &str) -> tungstenite::handshake::client::Request {
    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request.headers_mut().insert("client-id", DEVICE_ID.parse().unwrap());
    request.headers_mut().insert("session-id", session_id.parse().unwrap());
    request
}

async fn next_server_message<S>(ws: &mut S) -> ServerMessage
where
    S: futures_util::Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return serde_json::from_str(&text).unwrap(),
            Ok(Some(Ok(_))) => continue,
            other => panic!("no server message: {:?}", other),
        }
    }
}

#[tokio::test]
async fn websocket_subscription_receives_snapshot_then_events() {
    let h = harness();
    let publisher = h.gateway.subscriptions().register_source(Arc::new(OfferBook));
    let addr = spawn_websocket_server(&h.gateway).await;

    let request = client_request(addr, &h.session.session_id);
    let (mut ws, response) = tokio_test::assert_ok!(tokio_tungstenite::connect_async(request).await);
    assert_eq!(response.status(), 101);

    ws.send(Message::Text("not a subscription".to_string())).await.unwrap();
    ws.send(Message::Text(r#"{"requestId":"sub-1","topic":"OFFERS"}"#.to_string())).await.unwrap();

    match next_server_message(&mut ws).await {
        ServerMessage::SubscriptionResponse(response) => {
            assert_eq!(response.request_id, "sub-1");
            assert_eq!(response.payload.as_deref(), Some(r#"[{"id":"o-1"}]"#));
        }
        other => panic!("expected snapshot, got {:?}", other),
    }

    assert_eq!(publisher.publish(None, r#"{"id":"o-2"}"#, ModificationType::Added), 1);
    assert_eq!(publisher.publish(None, r#"{"id":"o-1"}"#, ModificationType::Removed), 1);

    for (expected_seq, expected_type) in [(1, ModificationType::Added), (2, ModificationType::Removed)] {
        match next_server_message(&mut ws).await {
            ServerMessage::WebSocketEvent(event) => {
                assert_eq!(event.subscriber_id, "sub-1");
                assert_eq!(event.sequence_number, expected_seq);
                assert_eq!(event.modification_type, expected_type);
            }
            other => panic!("expected event, got {:?}", other),
        }
    }

    ws.close(None).await.unwrap();
    for _ in 0..50 {
        if h.gateway.subscriptions().registry().subscriber_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.gateway.subscriptions().registry().subscriber_count(), 0);
}

#[tokio::test]
async fn websocket_handshake_with_unknown_session_is_rejected() {
    let h = harness();
    let addr = spawn_websocket_server(&h.gateway).await;

    match tokio_tungstenite::connect_async(client_request(addr, "no-such-session")).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected 401 handshake failure, got {:?}", other.map(|(_, r)| r.status())),
    }
}

/// Two distinct ports that were free a moment ago
fn free_ports() -> (u16, u16) {
    let first = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let second = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    (first.local_addr().unwrap().port(), second.local_addr().unwrap().port())
}

#[tokio::test]
async fn stop_closes_both_servers_and_open_connections() {
    let mut config = GatewayConfig::default();
    (config.server.http_port, config.server.websocket_port) = free_ports();
    let http_addr = config.http_addr().unwrap();
    let websocket_addr = config.websocket_addr().unwrap();

    let h = harness_with(config);
    h.gateway.subscriptions().register_source(Arc::new(OfferBook));
    let running = {
        let gateway = h.gateway.clone();
        tokio::spawn(async move { gateway.start().await })
    };

    // The WebSocket listener binds after the HTTP one
    let mut ws = None;
    for _ in 0..100 {
        let request = client_request(websocket_addr, &h.session.session_id);
        if let Ok((stream, _)) = tokio_tungstenite::connect_async(request).await {
            ws = Some(stream);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let mut ws = ws.expect("WebSocket server never came up");
    assert!(h.gateway.is_running().await);
    drop(tokio::net::TcpStream::connect(http_addr).await.unwrap());

    ws.send(Message::Text(r#"{"requestId":"sub-1","topic":"OFFERS"}"#.to_string())).await.unwrap();
    assert!(matches!(next_server_message(&mut ws).await, ServerMessage::SubscriptionResponse(_)));
    assert_eq!(h.gateway.subscriptions().registry().subscriber_count(), 1);

    h.gateway.stop().await.unwrap();

    let stopped = tokio::time::timeout(Duration::from_secs(5), running).await;
    assert!(matches!(stopped, Ok(Ok(Ok(())))), "start() did not return after stop()");
    assert!(!h.gateway.is_running().await);
    assert!(tokio::net::TcpStream::connect(http_addr).await.is_err());

    // The open connection is closed by the server and its subscriptions are gone
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server did not close the WebSocket");
    assert_eq!(h.gateway.subscriptions().registry().subscriber_count(), 0);
}
