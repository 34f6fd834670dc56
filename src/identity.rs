// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Identities and Handshake Resolution
//!
//! An [`Identity`] names an authenticated user. It is resolved once, when a
//! WebSocket is upgraded, from the query string of the upgrade request:
//!
//! - `token=<session token>`: verified with an [`IdentityVerifier`]
//! - `identity=<identity>` (also `user_id`, `userId`): a claimed identity,
//!   accepted only when the relay is configured to trust claimed identities
//!
//! Anything missing or invalid yields an anonymous connection. Resolution
//! never fails the connection itself.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

/// Longest identity accepted from a client, in bytes.
pub const MAX_IDENTITY_LEN: usize = 128;

/// Default session token lifetime (7 days).
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Stable, opaque name of an authenticated user.
///
/// Serialized as a plain string; deserialization applies the same
/// validation as [`Identity::new`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

/// Returned when a string is not a valid [`Identity`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid identity")]
pub struct InvalidIdentity;

impl Identity {
    /// Validates and wraps a raw identity string.
    ///
    /// Rejects empty strings, strings longer than [`MAX_IDENTITY_LEN`] and
    /// strings containing whitespace or control characters.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let valid = !raw.is_empty()
            && raw.len() <= MAX_IDENTITY_LEN
            && !raw.chars().any(|c| c.is_control() || c.is_whitespace());
        valid.then_some(Identity(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = InvalidIdentity;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Identity::new(raw).ok_or(InvalidIdentity)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity-bearing parameters of a WebSocket upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeParams {
    pub token: Option<String>,
    /// Claimed identity, from `identity`, `user_id` or `userId`.
    pub user_id: Option<String>,
}

impl HandshakeParams {
    /// Parses the query string of an upgrade request (without the leading `?`).
    ///
    /// Unknown keys are ignored; empty values count as absent. When a key
    /// repeats, the first occurrence wins.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut params = HandshakeParams::default();
        let Some(query) = query else {
            return params;
        };

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "token" if params.token.is_none() => params.token = Some(value.into_owned()),
                "identity" | "user_id" | "userId" if params.user_id.is_none() => {
                    params.user_id = Some(value.into_owned())
                }
                _ => {}
            }
        }

        params
    }
}

/// Verifies session tokens issued by the credential store.
pub trait IdentityVerifier: Send + Sync {
    /// Returns the identity a token was issued for, or `None` if the token
    /// is malformed, tampered with or expired.
    fn verify(&self, token: &str) -> Option<Identity>;
}

/// HMAC-SHA256 session tokens of the form
/// `base64url(identity).expires_at_secs.base64url(tag)`.
pub struct HmacTokenVerifier {
    key: hmac::Key,
}

impl HmacTokenVerifier {
    /// Creates a verifier keyed with a shared secret.
    pub fn new(secret: &[u8]) -> Self {
        HmacTokenVerifier {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    /// Creates a verifier with a random per-process secret.
    ///
    /// Tokens minted by such a verifier stop verifying after a restart.
    pub fn with_random_secret() -> Result<Self, ring::error::Unspecified> {
        let mut secret = [0u8; 32];
        SystemRandom::new().fill(&mut secret)?;
        Ok(Self::new(&secret))
    }

    /// Mints a token for `identity` valid for `ttl` from now.
    pub fn issue(&self, identity: &Identity, ttl: Duration) -> String {
        self.issue_at(identity, now_secs().saturating_add(ttl.as_secs()))
    }

    fn issue_at(&self, identity: &Identity, expires_at_secs: u64) -> String {
        let body = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(identity.as_str()),
            expires_at_secs
        );
        let tag = hmac::sign(&self.key, body.as_bytes());
        format!("{}.{}", body, URL_SAFE_NO_PAD.encode(tag.as_ref()))
    }

    fn verify_at(&self, token: &str, now_secs: u64) -> Option<Identity> {
        let (body, tag_b64) = token.rsplit_once('.')?;
        let tag = URL_SAFE_NO_PAD.decode(tag_b64).ok()?;
        hmac::verify(&self.key, body.as_bytes(), &tag).ok()?;

        let (identity_b64, expires) = body.split_once('.')?;
        let expires_at_secs: u64 = expires.parse().ok()?;
        if now_secs >= expires_at_secs {
            return None;
        }

        let raw = String::from_utf8(URL_SAFE_NO_PAD.decode(identity_b64).ok()?).ok()?;
        Identity::new(raw)
    }
}

impl IdentityVerifier for HmacTokenVerifier {
    fn verify(&self, token: &str) -> Option<Identity> {
        self.verify_at(token, now_secs())
    }
}

/// How the lifecycle manager turns handshake parameters into an identity.
#[derive(Clone)]
pub struct IdentityPolicy {
    verifier: Arc<dyn IdentityVerifier>,
    trust_claimed_identity: bool,
}

impl IdentityPolicy {
    pub fn new(verifier: Arc<dyn IdentityVerifier>, trust_claimed_identity: bool) -> Self {
        IdentityPolicy {
            verifier,
            trust_claimed_identity,
        }
    }

    /// Resolves the identity for a new connection, or `None` for anonymous.
    ///
    /// A token, when present, is authoritative: an invalid token never falls
    /// back to a claimed `user_id`.
    pub fn resolve(&self, params: &HandshakeParams) -> Option<Identity> {
        if let Some(ref token) = params.token {
            return self.verifier.verify(token);
        }
        if self.trust_claimed_identity {
            return params.user_id.clone().and_then(Identity::new);
        }
        None
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
