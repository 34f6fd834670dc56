//! Relay Server Configuration
//!
//! Configuration loaded from environment variables. Values that fail to
//! parse keep their defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::message_store::StorageBackend;

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// WebSocket listen address.
    pub listen_addr: SocketAddr,
    /// HTTP listen address (health, metrics, images).
    pub http_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// Maximum message text length in characters.
    pub max_text_len: usize,
    /// Maximum decoded image size in bytes.
    pub max_image_bytes: usize,
    /// Sends per minute per identity.
    pub rate_limit_per_min: u32,
    /// Rate limiter cleanup interval in seconds.
    pub cleanup_interval_secs: u64,
    pub storage_backend: StorageBackend,
    /// Directory for the message database and images.
    pub data_dir: PathBuf,
    /// Idle timeout in seconds, also applied to the upgrade handshake.
    pub idle_timeout_secs: u64,
    /// Per-connection outbound queue capacity.
    pub outbound_buffer: usize,
    /// Maximum messages returned by one history query.
    pub history_limit: usize,
    /// Base URL for image links; derived from `http_addr` when unset.
    pub public_url: Option<String>,
    /// HMAC secret for session tokens; random per process when unset.
    pub token_secret: Option<String>,
    /// Accept a claimed `identity`/`user_id` query parameter without a token.
    pub trust_claimed_identity: bool,
    /// Bearer token for the operator endpoints `/metrics` and `/online`.
    pub metrics_token: Option<String>,
    /// Bearer token the credential store presents to `POST /sessions`.
    /// Token issuing is disabled when unset.
    pub issuer_token: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 5001)),
            http_addr: SocketAddr::from(([127, 0, 0, 1], 5002)),
            max_connections: 1000,
            max_message_size: 10 * 1024 * 1024,
            max_text_len: 4000,
            max_image_bytes: 5 * 1024 * 1024,
            rate_limit_per_min: 60,
            cleanup_interval_secs: 3600,
            storage_backend: StorageBackend::Sqlite,
            data_dir: PathBuf::from("./data"),
            idle_timeout_secs: 300,
            outbound_buffer: 64,
            history_limit: 500,
            public_url: None,
            token_secret: None,
            trust_claimed_identity: true,
            metrics_token: None,
            issuer_token: None,
        }
    }
}

fn set_parsed<T: FromStr>(target: &mut T, value: Option<String>) {
    if let Some(parsed) = value.and_then(|v| v.trim().parse().ok()) {
        *target = parsed;
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl RelayConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        set_parsed(&mut config.listen_addr, var("RELAY_LISTEN_ADDR"));
        set_parsed(&mut config.http_addr, var("RELAY_HTTP_ADDR"));
        set_parsed(&mut config.max_connections, var("RELAY_MAX_CONNECTIONS"));
        set_parsed(&mut config.max_message_size, var("RELAY_MAX_MESSAGE_SIZE"));
        set_parsed(&mut config.max_text_len, var("RELAY_MAX_TEXT_LEN"));
        set_parsed(&mut config.max_image_bytes, var("RELAY_MAX_IMAGE_BYTES"));
        set_parsed(&mut config.rate_limit_per_min, var("RELAY_RATE_LIMIT"));
        set_parsed(&mut config.cleanup_interval_secs, var("RELAY_CLEANUP_INTERVAL"));
        set_parsed(&mut config.idle_timeout_secs, var("RELAY_IDLE_TIMEOUT"));
        set_parsed(&mut config.outbound_buffer, var("RELAY_OUTBOUND_BUFFER"));
        set_parsed(&mut config.history_limit, var("RELAY_HISTORY_LIMIT"));

        if let Some(val) = var("RELAY_STORAGE_BACKEND") {
            config.storage_backend = match val.to_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                _ => StorageBackend::Sqlite,
            };
        }

        if let Some(val) = non_empty(var("RELAY_DATA_DIR")) {
            config.data_dir = PathBuf::from(val);
        }

        if let Some(val) = var("RELAY_TRUST_CLAIMED_IDENTITY") {
            config.trust_claimed_identity =
                matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }

        config.public_url = non_empty(var("RELAY_PUBLIC_URL"));
        config.token_secret = non_empty(var("RELAY_TOKEN_SECRET"));
        config.metrics_token = non_empty(var("RELAY_METRICS_TOKEN"));
        config.issuer_token = non_empty(var("RELAY_ISSUER_TOKEN"));

        config
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Base URL image links are built from.
    pub fn public_url(&self) -> String {
        match self.public_url {
            Some(ref url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}", self.http_addr),
        }
    }
}
