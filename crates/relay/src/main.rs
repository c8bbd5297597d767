mod api;
mod config;
mod error;
mod ws;

use std::{sync::Arc, time::Instant};

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{header::HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tandem_engine::{
    ChannelTransport, CollabEngine, DocumentStore, MemoryDocumentStore, SqliteDocumentStore,
};
use tokio::net::TcpListener;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::error::{ApiError, ErrorCode};

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared by every route: the engine and the transport its sockets register with.
#[derive(Clone)]
pub(crate) struct AppState {
    pub engine: Arc<CollabEngine>,
    pub transport: Arc<ChannelTransport>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    let store = open_store(&config)?;
    let transport = Arc::new(ChannelTransport::new());
    let engine = CollabEngine::start(config.engine.clone(), store, transport.clone());
    let app = build_router(AppState { engine: engine.clone(), transport });

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting relay server");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly");

    let unflushed = engine.shutdown().await;
    if !unflushed.is_empty() {
        warn!(unflushed = ?unflushed, "relay stopped with unflushed documents");
    }
    served
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_store(config: &RelayConfig) -> anyhow::Result<Arc<dyn DocumentStore>> {
    match &config.database_path {
        Some(path) => {
            let store = SqliteDocumentStore::open(path)
                .with_context(|| format!("failed to open document database `{}`", path.display()))?;
            info!(path = %path.display(), "using sqlite document store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("no database configured, documents are kept in memory only");
            Ok(Arc::new(MemoryDocumentStore::new()))
        }
    }
}

fn build_router(state: AppState) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(ws::router())
            .merge(api::router())
            .with_state(state),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(panic_handler))
        .layer(middleware::from_fn(request_context_middleware))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            ApiError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

/// Tags every request with an id (the caller's `x-request-id` or a fresh
/// one) and logs its outcome inside a span carrying that id.
async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let span = info_span!(
        "http_request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    async move {
        let started_at = Instant::now();
        let mut response = next.run(request).await;
        if let Ok(header) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, header);
        }
        info!(
            status = response.status().as_u16(),
            latency_ms = started_at.elapsed().as_millis() as u64,
            "request completed"
        );
        response
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        routing::get,
        Router,
    };
    use tandem_engine::{ChannelTransport, CollabEngine, EngineConfig, MemoryDocumentStore};
    use tower::ServiceExt;

    use super::{apply_middleware, build_router, AppState};

    fn test_router() -> Router {
        let transport = Arc::new(ChannelTransport::new());
        let engine = Arc::new(CollabEngine::new(
            EngineConfig::default(),
            Arc::new(MemoryDocumentStore::new()),
            transport.clone(),
        ));
        build_router(AppState { engine, transport })
    }

    #[tokio::test]
    async fn health_check_has_request_id_header() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .expect("healthz request should build"),
            )
            .await
            .expect("healthz request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn caller_request_id_is_echoed() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/v1/documents")
                    .header("x-request-id", "req-42")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-request-id").and_then(|v| v.to_str().ok()),
            Some("req-42")
        );
    }

    #[tokio::test]
    async fn websocket_route_requires_an_upgrade() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/v1/ws?user_id=alice")
                    .body(Body::empty())
                    .expect("ws request should build"),
            )
            .await
            .expect("ws request should return a response");

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn panicking_route_becomes_a_500_and_keeps_the_request_id() {
        async fn explode() -> &'static str {
            panic!("route exploded");
        }

        let response = apply_middleware(Router::new().route("/explode", get(explode)))
            .oneshot(
                Request::builder()
                    .uri("/explode")
                    .header("x-request-id", "req-panic")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("x-request-id").and_then(|v| v.to_str().ok()),
            Some("req-panic")
        );

        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        let value: serde_json::Value = serde_json::from_slice(&body).expect("body should be json");
        assert_eq!(value["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(value["error"]["retryable"], true);
        assert_eq!(value["error"]["message"], "internal server error");
    }
}
