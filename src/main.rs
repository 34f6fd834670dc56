// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Chat Relay Server
//!
//! Real-time presence and message delivery for chat clients.
//! Provides:
//! - WebSocket endpoint for presence updates, live messages and history
//! - HTTP endpoints for health, metrics, the online set and images
//! - Per-identity send rate limiting

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use chat_relay::config::RelayConfig;
use chat_relay::connection_registry::ConnectionRegistry;
use chat_relay::delivery::DeliveryRouter;
use chat_relay::handler::{self, ConnectionDeps};
use chat_relay::http::{create_router, HttpState};
use chat_relay::identity::{HmacTokenVerifier, IdentityPolicy};
use chat_relay::image_store::{create_image_store, ImageStore};
use chat_relay::lifecycle::LifecycleManager;
use chat_relay::message_store::{create_message_store, MessageStore};
use chat_relay::messaging::{MessageLimits, MessageService};
use chat_relay::metrics::RelayMetrics;
use chat_relay::presence::PresenceBroadcaster;
use chat_relay::rate_limit::RateLimiter;

/// Rate limiter buckets idle this long are dropped.
const RATE_LIMIT_IDLE: Duration = Duration::from_secs(1800);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chat_relay=info".parse().expect("valid log directive")),
        )
        .init();

    let config = RelayConfig::from_env();

    let store: Arc<dyn MessageStore> = Arc::from(
        create_message_store(config.storage_backend, Some(&config.data_dir))
            .expect("Failed to open message store"),
    );
    let images: Arc<dyn ImageStore> = Arc::from(
        create_image_store(config.storage_backend, &config.data_dir, &config.public_url())
            .expect("Failed to open image store"),
    );

    let verifier = Arc::new(match config.token_secret {
        Some(ref secret) => HmacTokenVerifier::new(secret.as_bytes()),
        None => {
            warn!("RELAY_TOKEN_SECRET not set; session tokens will not survive a restart");
            HmacTokenVerifier::with_random_secret().expect("Failed to generate token secret")
        }
    });
    if config.trust_claimed_identity {
        warn!("Trusting claimed identities without a token; set RELAY_TRUST_CLAIMED_IDENTITY=false to require tokens");
    }
    if config.issuer_token.is_none() {
        info!("RELAY_ISSUER_TOKEN not set; POST /sessions is disabled");
    }
    let identity_policy = IdentityPolicy::new(verifier.clone(), config.trust_claimed_identity);

    let metrics = RelayMetrics::new();
    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = Arc::new(PresenceBroadcaster::new(registry.clone()));
    let router = Arc::new(DeliveryRouter::new(registry.clone(), broadcaster.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_per_min));
    let messages = Arc::new(MessageService::new(
        store.clone(),
        images.clone(),
        router,
        rate_limiter.clone(),
        metrics.clone(),
        MessageLimits {
            max_text_len: config.max_text_len,
            max_image_bytes: config.max_image_bytes,
            history_limit: config.history_limit,
        },
    ));

    info!("Starting chat relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Storage backend: {:?} ({})", config.storage_backend, config.data_dir.display());
    info!("Stored messages: {}", store.message_count());
    info!("Max connections: {}", config.max_connections);
    info!("Rate limit: {} sends/min", config.rate_limit_per_min);
    info!("Idle timeout: {}s", config.idle_timeout_secs);

    // HTTP server for health, metrics, presence, sessions and images
    let http_state = HttpState {
        metrics: metrics.clone(),
        metrics_token: config.metrics_token.clone(),
        issuer_token: config.issuer_token.clone(),
        tokens: verifier,
        registry: registry.clone(),
        images,
        started_at: Instant::now(),
    };
    let http_router = create_router(http_state);
    let http_listener = TcpListener::bind(&config.http_addr)
        .await
        .expect("Failed to bind HTTP listener");
    let http_addr = config.http_addr;
    tokio::spawn(async move {
        info!("HTTP server listening on {}", http_addr);
        if let Err(e) = axum::serve(http_listener, http_router).await {
            error!("HTTP server failed: {}", e);
        }
    });

    // Drop rate limiter buckets for identities that went quiet.
    let cleanup_interval = config.cleanup_interval();
    let cleanup_rate_limiter = rate_limiter.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(cleanup_interval).await;
            let removed = cleanup_rate_limiter.cleanup_inactive(RATE_LIMIT_IDLE);
            if removed > 0 {
                info!("Cleaned up {} stale rate limiter entries", removed);
            }
        }
    });

    let deps = ConnectionDeps {
        identity_policy,
        lifecycle: LifecycleManager::new(registry, broadcaster),
        messages,
        metrics: metrics.clone(),
        max_message_size: config.max_message_size,
        idle_timeout: config.idle_timeout(),
        outbound_buffer: config.outbound_buffer,
    };

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .expect("Failed to bind WebSocket listener");
    info!("WebSocket server listening on {}", config.listen_addr);

    let slots = Arc::new(Semaphore::new(config.max_connections));
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _addr)) => stream,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                continue;
            }
        };

        let permit = match slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "Connection rejected: at max capacity ({})",
                    config.max_connections
                );
                metrics.connections_rejected.inc();
                drop(stream);
                continue;
            }
        };

        let deps = deps.clone();
        tokio::spawn(async move {
            handler::accept_connection(stream, deps).await;
            drop(permit);
        });
    }
}
