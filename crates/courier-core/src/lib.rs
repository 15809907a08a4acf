//! # courier-core
//!
//! Concurrency core of Courier, a chat-message gateway that drives one
//! long-lived messaging session.
//!
//! This crate has no HTTP dependencies and is used by:
//! - `courier-http` (REST/WebSocket surface)
//! - `courier-daemon` (the `courier` binary)
//!
//! ## Key Concepts
//!
//! - **Job**: one outbound operation, run alone on the [`OperationQueue`] with a time budget
//! - **Session**: the single active provider connection, owned by the [`SessionController`]
//! - **Failover**: destroy the current session and create one for the next pool identity
//! - **Correlation**: attributing the first inbound reply to a previously sent message

pub mod config;
pub mod context;
pub mod correlator;
pub mod error;
pub mod event_bus;
pub mod logging;
pub mod messenger;
pub mod provider;
pub mod queue;
pub mod session;
mod sync;
pub mod target;

// Re-export commonly used types
pub use config::{CourierConfig, FailoverPolicy};
pub use context::CourierContext;
pub use correlator::{Reply, ReplyCorrelator, ReplyOutcome};
pub use error::{CourierError, Result};
pub use messenger::{Health, Messenger, SendReceipt};
pub use queue::{JobTicket, OperationQueue};
pub use session::{SessionController, SessionLease, SessionState};
pub use target::ChatTarget;
