//! Per-instance session lifecycle.

use serde::Serialize;

/// Lifecycle of one provider session instance.
///
/// `uninitialized -> connecting -> ready -> {disconnected, destroyed}`.
/// `Destroyed` is terminal; failover always builds a fresh instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Uninitialized,
    Connecting,
    Ready,
    Disconnected,
    Destroyed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Disconnected => "disconnected",
            SessionState::Destroyed => "destroyed",
        }
    }

    pub fn is_ready(self) -> bool {
        self == SessionState::Ready
    }

    /// Whether an instance in this state may move to `next`.
    ///
    /// Provider events can race with teardown, so late `ready` or
    /// `disconnected` notifications must not revive a retired instance.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (Disconnected, _) => false,
            (Uninitialized, Connecting | Ready | Disconnected) => true,
            (Connecting, Ready | Disconnected) => true,
            (Ready, Disconnected) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
