// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Connection Handler
//!
//! Upgrades a TCP stream, resolves the connection's identity from the
//! upgrade query string, then runs the connection's read/push loop until
//! the socket closes or goes idle.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::connection_registry::ConnectionHandle;
use crate::identity::{HandshakeParams, Identity, IdentityPolicy};
use crate::lifecycle::LifecycleManager;
use crate::message_store::ChatMessage;
use crate::messaging::MessageService;
use crate::metrics::RelayMetrics;
use crate::protocol::{self, ClientRequest, History, MessageStored, ServerEvent};

type WsWrite = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Shared dependencies for handling a WebSocket connection.
#[derive(Clone)]
pub struct ConnectionDeps {
    pub identity_policy: IdentityPolicy,
    pub lifecycle: LifecycleManager,
    pub messages: Arc<MessageService>,
    pub metrics: RelayMetrics,
    pub max_message_size: usize,
    /// Applies to the upgrade handshake and to inbound silence.
    pub idle_timeout: Duration,
    pub outbound_buffer: usize,
}

/// Performs the WebSocket upgrade and runs the connection.
pub async fn accept_connection(stream: TcpStream, deps: ConnectionDeps) {
    let mut query: Option<String> = None;
    let capture_query = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        query = req.uri().query().map(str::to_owned);
        Ok(resp)
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(deps.max_message_size);
    ws_config.max_frame_size = Some(deps.max_message_size);

    let upgraded = timeout(
        deps.idle_timeout,
        accept_hdr_async_with_config(stream, capture_query, Some(ws_config)),
    )
    .await;

    match upgraded {
        Ok(Ok(ws_stream)) => {
            let params = HandshakeParams::from_query(query.as_deref());
            handle_connection(ws_stream, params, deps).await;
        }
        Ok(Err(e)) => {
            warn!("WebSocket handshake failed: {}", e);
            deps.metrics.connections_rejected.inc();
        }
        Err(_) => {
            warn!("WebSocket handshake timeout (slowloris protection)");
            deps.metrics.connections_rejected.inc();
        }
    }
}

/// Handles an upgraded WebSocket connection.
pub async fn handle_connection(
    ws_stream: WebSocketStream<TcpStream>,
    params: HandshakeParams,
    deps: ConnectionDeps,
) {
    // Tokens and identities stay out of info-level logs.
    let session = uuid::Uuid::new_v4().to_string()[..8].to_string();

    let identity = deps.identity_policy.resolve(&params);
    if identity.is_none() {
        if params.token.is_some() {
            warn!("[{}] Invalid session token, continuing anonymous", session);
        }
        deps.metrics.connections_anonymous.inc();
    }

    deps.metrics.connections_total.inc();
    deps.metrics.connections_active.inc();
    info!(
        "[{}] Connection open ({})",
        session,
        if identity.is_some() { "identified" } else { "anonymous" }
    );

    run_session(ws_stream, identity, &deps, &session).await;

    deps.metrics.connections_active.dec();
    info!("[{}] Connection closed", session);
}

async fn run_session(
    ws_stream: WebSocketStream<TcpStream>,
    identity: Option<Identity>,
    deps: &ConnectionDeps,
    session: &str,
) {
    let (mut write, mut read) = ws_stream.split();

    // The acknowledgment precedes any presence event.
    if !send_event(&mut write, &ServerEvent::handshake_ack(identity.clone()), session).await {
        return;
    }

    let (handle, mut events) = ConnectionHandle::new(deps.outbound_buffer);
    let eviction = handle.clone();
    let mut lifecycle = deps.lifecycle.connecting(identity, handle);
    if let Some(report) = lifecycle.open() {
        deps.metrics.record_announce(&report);
    }

    loop {
        let msg = tokio::select! {
            inbound = timeout(deps.idle_timeout, read.next()) => {
                match inbound {
                    Ok(Some(msg)) => msg,
                    Ok(None) => {
                        debug!("[{}] Disconnected", session);
                        break;
                    }
                    Err(_) => {
                        warn!("[{}] Idle timeout", session);
                        break;
                    }
                }
            }
            // Removed from the registry after a failed push.
            _ = eviction.evicted() => {
                warn!("[{}] Evicted after a failed push, closing", session);
                break;
            }
            // Presence and deliveries pushed by other connections.
            Some(event) = events.recv() => {
                if !send_event(&mut write, &event, session).await {
                    break;
                }
                continue;
            }
        };

        match msg {
            Ok(Message::Binary(data)) => {
                let reply = handle_request(deps, lifecycle.identity(), &data, session);
                let mut write_failed = false;
                for event in &reply.events {
                    if !send_event(&mut write, event, session).await {
                        write_failed = true;
                        break;
                    }
                }
                // Delivery runs after the sender has its acknowledgment,
                // and regardless of whether that acknowledgment arrived.
                if let Some(ref message) = reply.deliver {
                    deps.messages.deliver(message);
                }
                if write_failed {
                    break;
                }
            }
            Ok(Message::Ping(data)) => {
                if write.send(Message::Pong(data)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                debug!("[{}] Client closed connection", session);
                break;
            }
            Ok(_) => {
                // Text and pong frames carry nothing for us.
            }
            Err(e) => {
                debug!("[{}] WebSocket error: {}", session, e);
                break;
            }
        }
    }

    if let Some(report) = lifecycle.close() {
        deps.metrics.record_announce(&report);
    }
}

/// Direct replies to one inbound frame, plus a stored message to deliver
/// once the replies are written.
#[derive(Debug, Default)]
pub struct Reply {
    pub events: Vec<ServerEvent>,
    pub deliver: Option<ChatMessage>,
}

impl Reply {
    fn event(event: ServerEvent) -> Self {
        Reply {
            events: vec![event],
            deliver: None,
        }
    }
}

/// Decodes and processes one binary frame from a client.
pub fn handle_request(
    deps: &ConnectionDeps,
    identity: Option<&Identity>,
    data: &[u8],
    session: &str,
) -> Reply {
    let envelope = match protocol::decode_request(data) {
        Ok(e) => e,
        Err(e) => {
            warn!("[{}] Failed to decode request: {}", session, e);
            return Reply::event(ServerEvent::error("malformed_request", e.to_string(), None));
        }
    };

    match envelope.payload {
        ClientRequest::SendMessage(request) => {
            let client_ref = request.client_ref.clone();
            match deps.messages.store_message(identity, request) {
                Ok(message) => Reply {
                    events: vec![ServerEvent::MessageStored(MessageStored {
                        client_ref,
                        message: message.clone(),
                    })],
                    deliver: Some(message),
                },
                Err(e) => {
                    debug!("[{}] Send refused: {}", session, e);
                    Reply::event(ServerEvent::error(e.code(), e.to_string(), client_ref))
                }
            }
        }
        ClientRequest::HistoryQuery(query) => {
            let Some(requester) = identity else {
                return Reply::event(ServerEvent::error(
                    "anonymous",
                    "anonymous connections have no history",
                    None,
                ));
            };
            match deps.messages.history(requester, &query.with, query.limit) {
                Ok(messages) => Reply::event(ServerEvent::History(History {
                    with: query.with,
                    messages,
                })),
                Err(e) => {
                    error!("[{}] History query failed: {}", session, e);
                    Reply::event(ServerEvent::error("store_failed", "history unavailable", None))
                }
            }
        }
        ClientRequest::Unknown => {
            debug!("[{}] Ignoring unknown request type", session);
            Reply::default()
        }
    }
}

/// Writes one event to the socket. Returns false when the socket is gone.
async fn send_event(write: &mut WsWrite, event: &ServerEvent, session: &str) -> bool {
    let data = match protocol::encode_event(event) {
        Ok(data) => data,
        Err(e) => {
            error!("[{}] Failed to encode {}: {}", session, event.kind(), e);
            return true;
        }
    };
    if let Err(e) = write.send(Message::Binary(data)).await {
        debug!("[{}] Failed to send {}: {}", session, event.kind(), e);
        return false;
    }
    true
}
