//! # courier-http
//!
//! HTTP surface for Courier: REST routes for sending and reply lookups, a
//! WebSocket event stream, and the webhook a session sidecar pushes
//! provider events to.

mod auth;
mod routes;
mod state;
mod websocket;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

pub use routes::{ApiError, ApiResponse};
pub use state::HttpState;

const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Listener and access settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// When set, every route except `/health` requires this bearer token.
    pub auth_token: Option<String>,
    pub max_upload_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            auth_token: None,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl HttpConfig {
    pub fn addr(&self) -> Result<SocketAddr, String> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| format!("Invalid address: {}", e))
    }
}

/// Build the application router.
pub fn router(state: Arc<HttpState>) -> Router {
    let protected = Router::new()
        .route("/send-text", post(routes::send_text))
        .route("/send-file", post(routes::send_file))
        .route("/send-location", post(routes::send_location))
        .route("/send-and-wait", post(routes::send_and_wait))
        .route("/reply-status/{message_id}", get(routes::reply_status))
        .route("/chats/{target}/messages", get(routes::chat_messages))
        .route("/ws/events", get(websocket::ws_handler))
        .route(
            "/provider/events/{identity}/{session_id}",
            post(routes::provider_event),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::auth_middleware,
        ));

    Router::new()
        .route("/health", get(routes::health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(state.max_upload_bytes))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Bind a listener for `config`.
pub async fn bind(config: &HttpConfig) -> std::io::Result<TcpListener> {
    let addr = config
        .addr()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    TcpListener::bind(addr).await
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn serve(
    state: Arc<HttpState>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("HTTP server listening on http://{}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            log::info!("HTTP server shutting down");
        })
        .await
}

// ============================================================================
// TESTS
// ============================================================================
