// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common test utilities for relay integration tests.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use chat_relay::config::RelayConfig;
use chat_relay::connection_registry::ConnectionRegistry;
use chat_relay::delivery::DeliveryRouter;
use chat_relay::handler::{self, ConnectionDeps};
use chat_relay::identity::{HmacTokenVerifier, Identity, IdentityPolicy};
use chat_relay::image_store::MemoryImageStore;
use chat_relay::lifecycle::LifecycleManager;
use chat_relay::message_store::{MemoryMessageStore, MessageStore};
use chat_relay::messaging::{MessageLimits, MessageService};
use chat_relay::metrics::RelayMetrics;
use chat_relay::presence::PresenceBroadcaster;
use chat_relay::rate_limit::RateLimiter;

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const FRAME_HEADER_SIZE: usize = 4;
pub const TOKEN_SECRET: &[u8] = b"integration-test-secret";

/// A fully wired relay core backed by in-memory stores.
#[allow(dead_code)]
pub struct TestRelay {
    pub deps: ConnectionDeps,
    pub registry: Arc<ConnectionRegistry>,
    pub store: Arc<dyn MessageStore>,
    pub verifier: Arc<HmacTokenVerifier>,
}

#[allow(dead_code)]
pub fn identity(name: &str) -> Identity {
    Identity::new(name).unwrap()
}

/// Creates a relay that trusts `user_id` query parameters.
#[allow(dead_code)]
pub fn test_relay() -> TestRelay {
    test_relay_with_store(Arc::new(MemoryMessageStore::new()))
}

#[allow(dead_code)]
pub fn test_relay_with_store(store: Arc<dyn MessageStore>) -> TestRelay {
    build_relay(store, true, 600, 64)
}

/// Creates a relay wired the way the binary wires `config`.
#[allow(dead_code)]
pub fn test_relay_with_config(config: &RelayConfig) -> TestRelay {
    build_relay(
        Arc::new(MemoryMessageStore::new()),
        config.trust_claimed_identity,
        config.rate_limit_per_min,
        config.outbound_buffer,
    )
}

fn build_relay(
    store: Arc<dyn MessageStore>,
    trust_claimed_identity: bool,
    rate_limit_per_min: u32,
    outbound_buffer: usize,
) -> TestRelay {
    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = Arc::new(PresenceBroadcaster::new(registry.clone()));
    let router = Arc::new(DeliveryRouter::new(registry.clone(), broadcaster.clone()));
    let metrics = RelayMetrics::new();
    let verifier = Arc::new(HmacTokenVerifier::new(TOKEN_SECRET));

    let messages = Arc::new(MessageService::new(
        store.clone(),
        Arc::new(MemoryImageStore::new("http://relay.test")),
        router,
        Arc::new(RateLimiter::new(rate_limit_per_min)),
        metrics.clone(),
        MessageLimits::default(),
    ));

    let deps = ConnectionDeps {
        identity_policy: IdentityPolicy::new(verifier.clone(), trust_claimed_identity),
        lifecycle: LifecycleManager::new(registry.clone(), broadcaster),
        messages,
        metrics,
        max_message_size: 1_048_576,
        idle_timeout: Duration::from_secs(5),
        outbound_buffer,
    };

    TestRelay {
        deps,
        registry,
        store,
        verifier,
    }
}

/// Starts a server accepting any number of connections. Returns the base URL.
#[allow(dead_code)]
pub async fn start_test_server(deps: ConnectionDeps) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(handler::accept_connection(stream, deps.clone()));
        }
    });

    format!("ws://127.0.0.1:{}", addr.port())
}

/// Connects with the given query string (e.g. `user_id=alice`).
#[allow(dead_code)]
pub async fn connect(base: &str, query: &str) -> Ws {
    let url = if query.is_empty() {
        format!("{}/", base)
    } else {
        format!("{}/?{}", base, query)
    };
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

/// Connects as `name` and consumes the HandshakeAck and the first presence
/// event.
#[allow(dead_code)]
pub async fn connect_as(base: &str, name: &str) -> Ws {
    let mut ws = connect(base, &format!("user_id={}", name)).await;
    let ack = recv(&mut ws).await;
    assert_eq!(ack["payload"]["type"], "HandshakeAck");
    assert_eq!(ack["payload"]["identity"], name);
    let presence = recv_type(&mut ws, "PresenceChanged").await;
    assert!(online(&presence).contains(&name.to_string()));
    ws
}

/// Encodes a JSON value into a binary frame (4-byte BE length prefix + JSON).
#[allow(dead_code)]
pub fn encode_envelope(envelope: &Value) -> Vec<u8> {
    let json = serde_json::to_vec(envelope).unwrap();
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + json.len());
    frame.extend_from_slice(&(json.len() as u32).to_be_bytes());
    frame.extend_from_slice(&json);
    frame
}

/// Decodes a binary frame back to a JSON value.
#[allow(dead_code)]
pub fn decode_envelope(data: &[u8]) -> Value {
    assert!(data.len() >= FRAME_HEADER_SIZE, "Frame too short");
    serde_json::from_slice(&data[FRAME_HEADER_SIZE..]).unwrap()
}

#[allow(dead_code)]
fn envelope(payload: Value) -> Value {
    json!({
        "version": 1,
        "message_id": uuid::Uuid::new_v4().to_string(),
        "timestamp": 1000,
        "payload": payload
    })
}

#[allow(dead_code)]
pub fn make_send(receiver: &str, text: &str, client_ref: &str) -> Value {
    envelope(json!({
        "type": "SendMessage",
        "receiver_id": receiver,
        "text": text,
        "client_ref": client_ref
    }))
}

#[allow(dead_code)]
pub fn make_history_query(with: &str) -> Value {
    envelope(json!({
        "type": "HistoryQuery",
        "with": with
    }))
}

#[allow(dead_code)]
pub async fn send(ws: &mut Ws, msg: &Value) {
    ws.send(Message::Binary(encode_envelope(msg))).await.unwrap();
}

/// Receives the next binary message as JSON.
#[allow(dead_code)]
pub async fn recv(ws: &mut Ws) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("Timeout waiting for message")
            .expect("Stream ended")
            .expect("WebSocket error");

        match msg {
            Message::Binary(data) => return decode_envelope(&data),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Expected Binary message, got {:?}", other),
        }
    }
}

/// Receives messages until one of the given payload type arrives.
#[allow(dead_code)]
pub async fn recv_type(ws: &mut Ws, kind: &str) -> Value {
    loop {
        let msg = recv(ws).await;
        if msg["payload"]["type"] == kind {
            return msg;
        }
    }
}

/// Receives presence events until one lists exactly `expected`.
#[allow(dead_code)]
pub async fn recv_presence(ws: &mut Ws, expected: &[&str]) -> Value {
    loop {
        let msg = recv_type(ws, "PresenceChanged").await;
        if online(&msg) == expected {
            return msg;
        }
    }
}

/// Tries to receive a binary message with a short timeout.
#[allow(dead_code)]
pub async fn try_recv(ws: &mut Ws) -> Option<Value> {
    match timeout(Duration::from_millis(200), ws.next()).await {
        Ok(Some(Ok(Message::Binary(data)))) => Some(decode_envelope(&data)),
        _ => None,
    }
}

/// Online identities listed by a PresenceChanged event, sorted.
#[allow(dead_code)]
pub fn online(presence: &Value) -> Vec<String> {
    let mut names: Vec<String> = presence["payload"]["online"]
        .as_array()
        .expect("online list")
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    names.sort();
    names
}
