//! Data exchanged with a messaging provider.

use serde::{Deserialize, Serialize};

use crate::target::ChatTarget;

/// One entry of the session identity pool.
///
/// The provider uses it to pick which stored credentials/auth directory backs
/// a session, so rotating identities means rotating accounts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionIdentity(pub String);

impl SessionIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload of an outbound send.
///
/// Media bytes serialize as a plain JSON number array on the bridge wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutgoingContent {
    Text {
        body: String,
    },
    Media {
        data: Vec<u8>,
        mime_type: String,
        filename: Option<String>,
        caption: Option<String>,
    },
}

impl OutgoingContent {
    /// Short human-readable form used by the audit log.
    pub fn summary(&self) -> String {
        match self {
            OutgoingContent::Text { body } => body.clone(),
            OutgoingContent::Media {
                data,
                mime_type,
                filename,
                ..
            } => format!(
                "[media {} {} bytes{}]",
                mime_type,
                data.len(),
                filename
                    .as_deref()
                    .map(|f| format!(" {f}"))
                    .unwrap_or_default()
            ),
        }
    }
}

/// What the provider reports after accepting an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    pub message_id: String,
    pub ack: i32,
    /// Unix seconds.
    pub timestamp: i64,
    pub sender: String,
    pub receiver: String,
}

/// A message observed on a conversation, inbound or from history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub from: String,
    #[serde(default)]
    pub to: String,
    pub body: String,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default)]
    pub from_me: bool,
}

impl ChatMessage {
    /// Conversation this message belongs to, from the local account's view.
    pub fn conversation(&self) -> &str {
        if self.from_me {
            &self.to
        } else {
            &self.from
        }
    }
}

/// Session-level notifications a provider emits after `initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    Qr { payload: String },
    Ready,
    Disconnected { reason: String },
    AuthFailure { message: String },
    Message { message: ChatMessage },
}

impl ProviderEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderEvent::Qr { .. } => "qr",
            ProviderEvent::Ready => "ready",
            ProviderEvent::Disconnected { .. } => "disconnected",
            ProviderEvent::AuthFailure { .. } => "auth_failure",
            ProviderEvent::Message { .. } => "message",
        }
    }
}

/// Request for a conversation's recent history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub conversation: ChatTarget,
    pub limit: usize,
}
