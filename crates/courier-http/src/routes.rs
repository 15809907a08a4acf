//! HTTP route handlers.
//!
//! Handlers only extract the request and forward it to the
//! [`Messenger`](courier_core::Messenger), which owns validation. Results are
//! wrapped in the `{success, data, error}` envelope.

use std::sync::Arc;

use axum::{
    extract::{
        multipart::MultipartRejection,
        rejection::JsonRejection,
        Multipart, Path, Query, State,
    },
    http::StatusCode,
    response::Json,
};
use courier_core::provider::{ProviderEvent, SessionIdentity};
use courier_core::{CourierError, ReplyOutcome};
use serde::{Deserialize, Serialize};

use crate::HttpState;

/// Response envelope shared by all routes.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    /// Stable machine-readable kind, e.g. `validation_error`.
    pub kind: String,
    pub message: String,
}

impl ApiResponse {
    pub fn ok(data: impl Serialize) -> Self {
        Self {
            success: true,
            data: Some(serde_json::to_value(data).unwrap_or_default()),
            error: None,
        }
    }

    pub fn error(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                kind: kind.into(),
                message: message.into(),
            }),
        }
    }
}

type Reply = (StatusCode, Json<ApiResponse>);

fn status_for(err: &CourierError) -> StatusCode {
    match err {
        CourierError::Validation(_) => StatusCode::BAD_REQUEST,
        CourierError::NotFound(_) => StatusCode::NOT_FOUND,
        CourierError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        CourierError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
        CourierError::SessionFault(_) => StatusCode::BAD_GATEWAY,
        CourierError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(err: CourierError) -> Reply {
    let status = status_for(&err);
    if status.is_server_error() {
        log::warn!("request failed: {}", err);
    }
    (status, Json(ApiResponse::error(err.kind(), err.to_string())))
}

fn bad_request(message: impl Into<String>) -> Reply {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiResponse::error("validation_error", message)),
    )
}

fn respond<T: Serialize>(result: courier_core::Result<T>) -> Reply {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::ok(data))),
        Err(err) => failure(err),
    }
}

// ============================================================================
// SEND ROUTES
// ============================================================================

#[derive(Deserialize)]
pub struct TextRequest {
    target: String,
    body: String,
}

#[derive(Deserialize)]
pub struct LocationRequest {
    target: String,
    lat: f64,
    lon: f64,
    #[serde(default)]
    description: Option<String>,
}

/// Handler for POST /send-text
pub async fn send_text(
    State(state): State<Arc<HttpState>>,
    request: Result<Json<TextRequest>, JsonRejection>,
) -> Reply {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    respond(
        state
            .context
            .messenger
            .send_text(&request.target, &request.body)
            .await,
    )
}

/// Handler for POST /send-and-wait
pub async fn send_and_wait(
    State(state): State<Arc<HttpState>>,
    request: Result<Json<TextRequest>, JsonRejection>,
) -> Reply {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    respond(
        state
            .context
            .messenger
            .send_and_wait(&request.target, &request.body)
            .await,
    )
}

/// Handler for POST /send-location
pub async fn send_location(
    State(state): State<Arc<HttpState>>,
    request: Result<Json<LocationRequest>, JsonRejection>,
) -> Reply {
    let Json(request) = match request {
        Ok(request) => request,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    respond(
        state
            .context
            .messenger
            .send_location(
                &request.target,
                request.lat,
                request.lon,
                request.description.as_deref(),
            )
            .await,
    )
}

#[derive(Default)]
struct Upload {
    target: Option<String>,
    caption: Option<String>,
    data: Option<Vec<u8>>,
    filename: Option<String>,
    mime_type: Option<String>,
}

async fn read_upload(mut multipart: Multipart) -> Result<Upload, String> {
    let mut upload = Upload::default();
    while let Some(field) = multipart.next_field().await.map_err(|e| e.body_text())? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("target") => {
                upload.target = Some(field.text().await.map_err(|e| e.body_text())?)
            }
            Some("caption") => {
                upload.caption = Some(field.text().await.map_err(|e| e.body_text())?)
            }
            Some("file") => {
                upload.filename = field.file_name().map(str::to_string);
                upload.mime_type = field.content_type().map(str::to_string);
                upload.data = Some(field.bytes().await.map_err(|e| e.body_text())?.to_vec());
            }
            _ => {}
        }
    }
    Ok(upload)
}

/// Handler for POST /send-file (multipart: `target`, `caption`, `file`)
pub async fn send_file(
    State(state): State<Arc<HttpState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Reply {
    let multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let upload = match read_upload(multipart).await {
        Ok(upload) => upload,
        Err(message) => return bad_request(message),
    };
    let Some(target) = upload.target else {
        return bad_request("Missing required field: target");
    };
    let Some(data) = upload.data else {
        return bad_request("Missing required field: file");
    };

    respond(
        state
            .context
            .messenger
            .send_file(&target, data, upload.mime_type, upload.filename, upload.caption)
            .await,
    )
}

// ============================================================================
// QUERY ROUTES
// ============================================================================

/// Handler for GET /reply-status/{messageId}
///
/// Blocks until the reply arrives or the wait deadline fires.
pub async fn reply_status(
    Path(message_id): Path<String>,
    State(state): State<Arc<HttpState>>,
) -> Reply {
    match state.context.messenger.reply_status(&message_id).await {
        Ok(ReplyOutcome::Replied(reply)) => (StatusCode::OK, Json(ApiResponse::ok(reply))),
        Ok(ReplyOutcome::TimedOut) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(
                "timeout",
                format!("No reply received for {}", message_id),
            )),
        ),
        Err(err) => failure(err),
    }
}

#[derive(Deserialize)]
pub struct HistoryParams {
    #[serde(default)]
    limit: Option<usize>,
}

/// Handler for GET /chats/{target}/messages
pub async fn chat_messages(
    Path(target): Path<String>,
    Query(params): Query<HistoryParams>,
    State(state): State<Arc<HttpState>>,
) -> Reply {
    respond(
        state
            .context
            .messenger
            .recent_messages(&target, params.limit)
            .await,
    )
}

/// Handler for GET /health
pub async fn health(State(state): State<Arc<HttpState>>) -> Reply {
    let health = state.context.messenger.health();
    let status = if health.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ApiResponse::ok(health)))
}

// ============================================================================
// PROVIDER WEBHOOK
// ============================================================================

/// Handler for POST /provider/events/{identity}/{session_id}
///
/// The session sidecar pushes qr/ready/disconnected/auth_failure/message
/// events here, tagged with the sidecar id of the session that raised them.
pub async fn provider_event(
    Path((identity, session_id)): Path<(String, String)>,
    State(state): State<Arc<HttpState>>,
    event: Result<Json<ProviderEvent>, JsonRejection>,
) -> Reply {
    let Json(event) = match event {
        Ok(event) => event,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let Some(bridge) = &state.bridge else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(
                "not_found",
                "No bridge provider is configured",
            )),
        );
    };

    match bridge.dispatch(&SessionIdentity::new(identity.as_str()), &session_id, event) {
        Ok(delivered) => (
            StatusCode::OK,
            Json(ApiResponse::ok(serde_json::json!({ "delivered": delivered }))),
        ),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(
                "not_found",
                format!("No live bridge session {} for identity {}", session_id, identity),
            )),
        ),
    }
}

// ============================================================================
// TESTS
// ============================================================================
