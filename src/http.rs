//! HTTP Server for Health, Metrics, Presence, Sessions and Images
//!
//! Runs on its own port next to the WebSocket listener.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::debug;

use crate::connection_registry::ConnectionRegistry;
use crate::identity::{HmacTokenVerifier, Identity, DEFAULT_TOKEN_TTL};
use crate::image_store::ImageStore;
use crate::metrics::RelayMetrics;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub metrics: RelayMetrics,
    /// Protects `/metrics` and `/online`.
    pub metrics_token: Option<String>,
    /// Protects `POST /sessions`; issuing is disabled when unset.
    pub issuer_token: Option<String>,
    pub tokens: Arc<HmacTokenVerifier>,
    pub registry: Arc<ConnectionRegistry>,
    pub images: Arc<dyn ImageStore>,
    pub started_at: Instant,
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        "Unauthorized",
    )
        .into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not found").into_response()
}

/// Guards the operator endpoints with `Authorization: Bearer <token>`.
///
/// `/metrics` is open when no token is configured; `/online` lists who is
/// connected and is not served at all without one.
async fn operator_auth_middleware(
    State(state): State<HttpState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if path != "/metrics" && path != "/online" {
        return next.run(request).await;
    }
    let Some(ref expected) = state.metrics_token else {
        if path == "/online" {
            return not_found();
        }
        return next.run(request).await;
    };

    if bearer(request.headers()) != Some(expected.as_str()) {
        return unauthorized();
    }
    next.run(request).await
}

pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/online", get(online_handler))
        .route("/sessions", post(issue_session_handler))
        .route("/images/:id", get(image_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            operator_auth_middleware,
        ))
        .with_state(state)
}

async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "chat-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/metrics", "/online", "/sessions", "/images/:id"]
    }))
}

async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "online": state.registry.connected_count(),
    }))
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    state
        .metrics
        .online_identities
        .set(state.registry.connected_count() as i64);

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
}

async fn online_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    Json(serde_json::json!({
        "revision": snapshot.revision,
        "online": snapshot.online,
    }))
}

/// Body of `POST /sessions`, sent by the credential store after it has
/// authenticated `identity`.
#[derive(Debug, Deserialize)]
struct IssueSession {
    identity: Identity,
    /// Capped at the default token lifetime.
    ttl_secs: Option<u64>,
}

async fn issue_session_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(request): Json<IssueSession>,
) -> Response {
    let Some(ref expected) = state.issuer_token else {
        return not_found();
    };
    if bearer(&headers) != Some(expected.as_str()) {
        return unauthorized();
    }

    let ttl = request
        .ttl_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TOKEN_TTL)
        .min(DEFAULT_TOKEN_TTL);
    let token = state.tokens.issue(&request.identity, ttl);
    debug!("Issued session token for {}", request.identity);

    Json(serde_json::json!({
        "token": token,
        "expires_in": ttl.as_secs(),
    }))
    .into_response()
}

async fn image_handler(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    match state.images.fetch(&id) {
        Some(image) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, image.content_type),
                (header::CACHE_CONTROL, "public, max-age=31536000, immutable".to_string()),
            ],
            image.data,
        )
            .into_response(),
        None => not_found(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_registry::ConnectionHandle;
    use crate::identity::IdentityVerifier;
    use crate::image_store::MemoryImageStore;
    use axum::body::{to_bytes, Body};
    use tower::ServiceExt;

    const ISSUER: &str = "issuer-secret";

    fn create_test_state(metrics_token: Option<&str>) -> HttpState {
        HttpState {
            metrics: RelayMetrics::new(),
            metrics_token: metrics_token.map(String::from),
            issuer_token: Some(ISSUER.to_string()),
            tokens: Arc::new(HmacTokenVerifier::new(b"http-test-secret")),
            registry: Arc::new(ConnectionRegistry::new()),
            images: Arc::new(MemoryImageStore::new("http://relay.test")),
            started_at: Instant::now(),
        }
    }

    async fn get(app: Router, uri: &str, auth: Option<&str>) -> Response {
        let mut builder = Request::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        app.oneshot(builder.body(Body::empty()).unwrap()).await.unwrap()
    }

    async fn post_json(app: Router, uri: &str, auth: Option<&str>, body: serde_json::Value) -> Response {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        app.oneshot(builder.body(Body::from(body.to_string())).unwrap())
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = get(create_router(create_test_state(None)), "/metrics", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_requires_token_when_configured() {
        let state = create_test_state(Some("s3cret"));

        let response = get(create_router(state.clone()), "/metrics", None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = get(create_router(state.clone()), "/metrics", Some("Bearer wrong")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = get(create_router(state.clone()), "/metrics", Some("Bearer s3cret")).await;
        assert_eq!(response.status(), StatusCode::OK);

        // Other routes stay open.
        let response = get(create_router(state), "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_online_lists_registered_identities() {
        let state = create_test_state(Some("s3cret"));
        let (handle, _rx) = ConnectionHandle::new(4);
        state
            .registry
            .register(Identity::new("alice").unwrap(), handle);

        let response = get(create_router(state.clone()), "/online", Some("Bearer s3cret")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["online"], serde_json::json!(["alice"]));
        assert_eq!(json["revision"], 1);

        let json = body_json(get(create_router(state), "/health", None).await).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["online"], 1);
    }

    #[tokio::test]
    async fn test_online_is_never_public() {
        let state = create_test_state(Some("s3cret"));
        let response = get(create_router(state), "/online", None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Without an operator token the endpoint is not served.
        let response = get(create_router(create_test_state(None)), "/online", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_issue_session_token() {
        let state = create_test_state(None);
        let response = post_json(
            create_router(state.clone()),
            "/sessions",
            Some("Bearer issuer-secret"),
            serde_json::json!({ "identity": "alice" }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["expires_in"], DEFAULT_TOKEN_TTL.as_secs());
        let token = json["token"].as_str().unwrap();
        assert_eq!(state.tokens.verify(token), Identity::new("alice"));
    }

    #[tokio::test]
    async fn test_issue_session_requires_issuer_token() {
        let state = create_test_state(None);
        let body = serde_json::json!({ "identity": "alice", "ttl_secs": 60 });

        let response = post_json(create_router(state.clone()), "/sessions", None, body.clone()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = post_json(
            create_router(state.clone()),
            "/sessions",
            Some("Bearer wrong"),
            body.clone(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut disabled = state;
        disabled.issuer_token = None;
        let response = post_json(
            create_router(disabled),
            "/sessions",
            Some("Bearer issuer-secret"),
            body,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_issue_session_caps_ttl_and_rejects_bad_identity() {
        let state = create_test_state(None);
        let response = post_json(
            create_router(state.clone()),
            "/sessions",
            Some("Bearer issuer-secret"),
            serde_json::json!({ "identity": "alice", "ttl_secs": u64::MAX }),
        )
        .await;
        let json = body_json(response).await;
        assert_eq!(json["expires_in"], DEFAULT_TOKEN_TTL.as_secs());

        let response = post_json(
            create_router(state),
            "/sessions",
            Some("Bearer issuer-secret"),
            serde_json::json!({ "identity": "has space" }),
        )
        .await;
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_image_served_with_content_type() {
        let state = create_test_state(None);
        let url = state.images.upload("image/gif", vec![7, 8, 9]).unwrap();
        let path = url.strip_prefix("http://relay.test").unwrap().to_string();

        let response = get(create_router(state), &path, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/gif");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], &[7, 8, 9]);
    }

    #[tokio::test]
    async fn test_missing_image_is_404() {
        let response = get(
            create_router(create_test_state(None)),
            "/images/00000000-0000-0000-0000-000000000000",
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
