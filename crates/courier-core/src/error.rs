//! Error taxonomy shared by every Courier component.
//!
//! Each variant maps to a stable `kind()` string that surfaces unchanged in
//! HTTP error bodies, so clients can branch on it without parsing messages.

use thiserror::Error;

use crate::provider::ProviderError;

/// Errors surfaced by the queue, the session controller and the correlator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CourierError {
    /// Malformed caller input. Rejected before anything is enqueued.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// No session has been created yet.
    #[error("No messaging session is initialized")]
    NotInitialized,

    /// A job exceeded its budget, or the readiness gate gave up.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The provider threw while initializing or operating a session.
    #[error("Session fault: {0}")]
    SessionFault(String),

    /// Unknown correlation id.
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CourierError {
    /// Stable, machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            CourierError::Validation(_) => "validation_error",
            CourierError::NotInitialized => "not_initialized",
            CourierError::Timeout(_) => "timeout",
            CourierError::SessionFault(_) => "session_fault",
            CourierError::NotFound(_) => "not_found",
            CourierError::Internal(_) => "internal",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CourierError::Timeout(_))
    }

    pub fn is_session_fault(&self) -> bool {
        matches!(self, CourierError::SessionFault(_))
    }
}

impl From<ProviderError> for CourierError {
    fn from(err: ProviderError) -> Self {
        CourierError::SessionFault(err.to_string())
    }
}

pub type Result<T, E = CourierError> = std::result::Result<T, E>;
