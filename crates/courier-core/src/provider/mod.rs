//! Messaging provider boundary.
//!
//! Courier never speaks the messaging protocol itself. A [`SessionProvider`]
//! creates [`ProviderSession`]s, and everything the core needs from the
//! outside world goes through those two traits:
//!
//! - [`loopback::LoopbackProvider`] - in-process provider for tests and local runs
//! - [`bridge::BridgeProvider`] - HTTP client for an external session sidecar

pub mod bridge;
pub mod loopback;
mod types;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::target::ChatTarget;

pub use types::{
    ChatMessage, HistoryQuery, OutgoingContent, ProviderEvent, SentMessage, SessionIdentity,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Provider rejected the request: {0}")]
    Rejected(String),

    #[error("Provider transport failed: {0}")]
    Transport(String),

    #[error("Session is closed")]
    Closed,
}

/// A live provider session.
///
/// Events are delivered through [`ProviderSession::subscribe`]; subscribers
/// must attach before calling [`ProviderSession::initialize`] or they may miss
/// the first `qr`/`ready` notifications.
#[async_trait]
pub trait ProviderSession: Send + Sync {
    fn identity(&self) -> &SessionIdentity;

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent>;

    /// Start connecting. Progress is reported through events.
    async fn initialize(&self) -> Result<(), ProviderError>;

    async fn send_message(
        &self,
        target: &ChatTarget,
        content: OutgoingContent,
    ) -> Result<SentMessage, ProviderError>;

    /// Fetch the most recent messages of one conversation, oldest first.
    async fn fetch_messages(&self, query: &HistoryQuery)
        -> Result<Vec<ChatMessage>, ProviderError>;

    /// Best-effort teardown.
    async fn destroy(&self) -> Result<(), ProviderError>;
}

/// Factory for provider sessions.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn create(
        &self,
        identity: &SessionIdentity,
    ) -> Result<Arc<dyn ProviderSession>, ProviderError>;
}
