// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Error Types
//!
//! Errors raised by the collaborators around the presence core (storage,
//! image uploads, wire decoding, the send path). The presence core itself
//! never fails; see `presence` and `delivery`.

use thiserror::Error;

/// Message store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Image upload failures.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image is not a base64 data URL")]
    NotDataUrl,
    #[error("unsupported image type: {0}")]
    UnsupportedType(String),
    #[error("invalid base64 payload: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("image too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame decoding failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too short")]
    FrameTooShort,
    #[error("frame length prefix {declared} does not match body {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons a send request is refused before or during persistence.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("anonymous connections cannot send messages")]
    Anonymous,
    #[error("message needs text or an image")]
    Empty,
    #[error("text too long: {len} chars (max {max})")]
    TextTooLong { len: usize, max: usize },
    #[error("rate limited")]
    RateLimited,
    #[error("image rejected: {0}")]
    Image(#[from] ImageError),
    #[error("message could not be stored: {0}")]
    Store(#[from] StoreError),
}

impl SendError {
    /// Short machine-readable code sent to clients in `Error` events.
    pub fn code(&self) -> &'static str {
        match self {
            SendError::Anonymous => "anonymous",
            SendError::Empty => "empty_message",
            SendError::TextTooLong { .. } => "text_too_long",
            SendError::RateLimited => "rate_limited",
            SendError::Image(_) => "invalid_image",
            SendError::Store(_) => "store_failed",
        }
    }
}
