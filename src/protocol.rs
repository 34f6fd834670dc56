// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire Protocol
//!
//! Every WebSocket frame is binary: a 4-byte big-endian length prefix
//! followed by a JSON [`Envelope`]. The envelope payload is tagged by its
//! `type` field.
//!
//! Server events: `HandshakeAck`, `PresenceChanged`, `MessageReceived`,
//! `MessageStored`, `History`, `Error`.
//! Client requests: `SendMessage`, `HistoryQuery`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::identity::Identity;
use crate::message_store::ChatMessage;

pub const PROTOCOL_VERSION: u8 = 1;
pub const FRAME_HEADER_SIZE: usize = 4;

/// Features advertised in the handshake acknowledgment.
pub const FEATURES: &[&str] = &["presence", "live_delivery", "history", "images"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<P> {
    pub version: u8,
    pub message_id: String,
    pub timestamp: u64,
    pub payload: P,
}

impl<P> Envelope<P> {
    pub fn new(payload: P) -> Self {
        Envelope {
            version: PROTOCOL_VERSION,
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            payload,
        }
    }
}

// ============================================================================
// Server → client
// ============================================================================

/// Events the relay pushes to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    HandshakeAck(HandshakeAck),
    /// The online set changed.
    PresenceChanged(PresenceChanged),
    /// A message addressed to this connection's identity was stored.
    MessageReceived(MessageReceived),
    /// Confirms to the sender that its message was stored.
    MessageStored(MessageStored),
    History(History),
    Error(ErrorEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub protocol_version: u8,
    pub server_version: String,
    pub features: Vec<String>,
    /// The identity this connection was registered under; absent for
    /// anonymous connections.
    #[serde(default)]
    pub identity: Option<Identity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceChanged {
    /// Registry revision the online set was read at. Never decreases
    /// across the events a single connection receives.
    pub revision: u64,
    pub online: Vec<Identity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageReceived {
    pub message: ChatMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageStored {
    #[serde(default)]
    pub client_ref: Option<String>,
    pub message: ChatMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub with: Identity,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub code: String,
    pub reason: String,
    #[serde(default)]
    pub client_ref: Option<String>,
}

impl ServerEvent {
    pub fn handshake_ack(identity: Option<Identity>) -> Self {
        ServerEvent::HandshakeAck(HandshakeAck {
            protocol_version: PROTOCOL_VERSION,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            features: FEATURES.iter().map(|f| f.to_string()).collect(),
            identity,
        })
    }

    pub fn error(code: &str, reason: impl Into<String>, client_ref: Option<String>) -> Self {
        ServerEvent::Error(ErrorEvent {
            code: code.to_string(),
            reason: reason.into(),
            client_ref,
        })
    }

    /// Event name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::HandshakeAck(_) => "HandshakeAck",
            ServerEvent::PresenceChanged(_) => "PresenceChanged",
            ServerEvent::MessageReceived(_) => "MessageReceived",
            ServerEvent::MessageStored(_) => "MessageStored",
            ServerEvent::History(_) => "History",
            ServerEvent::Error(_) => "Error",
        }
    }
}

// ============================================================================
// Client → server
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientRequest {
    SendMessage(SendMessage),
    HistoryQuery(HistoryQuery),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessage {
    pub receiver_id: Identity,
    #[serde(default)]
    pub text: Option<String>,
    /// Inline image as a `data:<mime>;base64,...` URL.
    #[serde(default)]
    pub image: Option<String>,
    /// Opaque client correlation ID echoed in `MessageStored` / `Error`.
    #[serde(default)]
    pub client_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub with: Identity,
    #[serde(default)]
    pub limit: Option<usize>,
}

// ============================================================================
// Framing
// ============================================================================

fn encode_frame<P: Serialize>(envelope: &Envelope<P>) -> Result<Vec<u8>, ProtocolError> {
    let json = serde_json::to_vec(envelope)?;
    let len = json.len() as u32;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + json.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&json);
    Ok(frame)
}

fn decode_frame<P: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<Envelope<P>, ProtocolError> {
    if data.len() < FRAME_HEADER_SIZE {
        return Err(ProtocolError::FrameTooShort);
    }

    let (header, json) = data.split_at(FRAME_HEADER_SIZE);
    let declared = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if declared != json.len() {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: json.len(),
        });
    }

    Ok(serde_json::from_slice(json)?)
}

/// Encodes a server event into a fresh envelope frame.
pub fn encode_event(event: &ServerEvent) -> Result<Vec<u8>, ProtocolError> {
    encode_frame(&Envelope::new(event))
}

/// Decodes a server event frame (client side and tests).
pub fn decode_event(data: &[u8]) -> Result<Envelope<ServerEvent>, ProtocolError> {
    decode_frame(data)
}

/// Encodes a client request into a fresh envelope frame (client side and tests).
pub fn encode_request(request: &ClientRequest) -> Result<Vec<u8>, ProtocolError> {
    encode_frame(&Envelope::new(request))
}

/// Decodes a client request frame.
pub fn decode_request(data: &[u8]) -> Result<Envelope<ClientRequest>, ProtocolError> {
    decode_frame(data)
}
