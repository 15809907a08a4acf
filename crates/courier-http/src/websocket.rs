//! WebSocket event stream.
//!
//! Clients connect to `/ws/events` and receive every `CourierEvent` whose
//! topic matches one of their patterns. Patterns come from the
//! `?events=session:*,message:*` query parameter and can be changed later by
//! sending `{"subscribe": "..."}` or `{"unsubscribe": "..."}` frames. With
//! no patterns, everything is forwarded.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use courier_core::event_bus::CourierEvent;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use crate::HttpState;

#[derive(Deserialize, Default)]
pub struct StreamParams {
    /// Comma-separated topic patterns.
    #[serde(default)]
    events: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ClientFrame {
    Subscribe { subscribe: String },
    Unsubscribe { unsubscribe: String },
}

/// Frame sent to the client.
#[derive(Serialize)]
struct WsEvent {
    /// Topic, e.g. `session:ready`.
    event_type: &'static str,
    payload: serde_json::Value,
}

type Patterns = Arc<Mutex<HashSet<String>>>;

fn parse_patterns(raw: Option<&str>) -> HashSet<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Handler for GET /ws/events
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<StreamParams>,
    State(state): State<Arc<HttpState>>,
) -> impl IntoResponse {
    let patterns = parse_patterns(params.events.as_deref());
    ws.on_upgrade(move |socket| handle_socket(socket, state, patterns))
}

async fn handle_socket(socket: WebSocket, state: Arc<HttpState>, initial: HashSet<String>) {
    let (mut sender, mut receiver) = socket.split();
    let patterns: Patterns = Arc::new(Mutex::new(initial));
    let mut events = state.context.event_bus.subscribe();

    let client_patterns = Arc::clone(&patterns);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else {
                continue;
            };
            let Ok(frame) = serde_json::from_str::<ClientFrame>(text.as_str()) else {
                log::debug!("ignoring unrecognized WebSocket frame");
                continue;
            };
            let mut patterns = client_patterns
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match frame {
                ClientFrame::Subscribe { subscribe } => {
                    patterns.insert(subscribe);
                }
                ClientFrame::Unsubscribe { unsubscribe } => {
                    patterns.remove(&unsubscribe);
                }
            }
        }
    });

    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(count)) => {
                    log::warn!("WebSocket client lagged by {} events", count);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if !wanted(&patterns, &event) {
                continue;
            }
            let frame = WsEvent {
                event_type: event.topic(),
                payload: serde_json::to_value(&event).unwrap_or_default(),
            };
            let Ok(json) = serde_json::to_string(&frame) else {
                continue;
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut recv_task => send_task.abort(),
        _ = &mut send_task => recv_task.abort(),
    }
    log::debug!("WebSocket connection closed");
}

fn wanted(patterns: &Patterns, event: &CourierEvent) -> bool {
    let patterns = patterns.lock().unwrap_or_else(PoisonError::into_inner);
    patterns.is_empty() || patterns.iter().any(|p| matches_pattern(event.topic(), p))
}

/// Whether `topic` matches `pattern`.
///
/// `*` alone matches everything, `session:*` matches any `session:` topic,
/// and `*` as a segment matches that one segment.
fn matches_pattern(topic: &str, pattern: &str) -> bool {
    if pattern == "*" || topic == pattern {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix(":*") {
        if topic.len() > prefix.len()
            && topic.starts_with(prefix)
            && topic[prefix.len()..].starts_with(':')
        {
            return true;
        }
    }

    if pattern.contains('*') {
        let pattern_parts: Vec<&str> = pattern.split(':').collect();
        let topic_parts: Vec<&str> = topic.split(':').collect();
        return pattern_parts.len() == topic_parts.len()
            && pattern_parts
                .iter()
                .zip(&topic_parts)
                .all(|(p, t)| *p == "*" || p == t);
    }

    false
}

// ============================================================================
// TESTS
// ============================================================================
