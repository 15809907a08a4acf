//! Bearer-token guard for the protected routes.
//!
//! `/health` stays public. Everything else requires the configured token,
//! either as `Authorization: Bearer <token>` or, for WebSocket clients that
//! cannot set headers, as `?token=<token>`.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use crate::routes::ApiResponse;
use crate::HttpState;

/// Token the client presented; the header wins over the query string.
fn presented_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);

    from_header.or_else(|| {
        uri.query()?
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, value)| value.to_string())
    })
}

pub async fn auth_middleware(
    State(state): State<Arc<HttpState>>,
    req: Request,
    next: Next,
) -> Response {
    let token = presented_token(req.headers(), req.uri());
    if state.validate_token(token.as_deref()) {
        return next.run(req).await;
    }

    log::debug!("rejected unauthenticated request to {}", req.uri().path());
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiResponse::error(
            "unauthorized",
            "Invalid or missing authentication token",
        )),
    )
        .into_response()
}
