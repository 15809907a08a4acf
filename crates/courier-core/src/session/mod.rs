//! Ownership of the single active provider session.
//!
//! - [`SessionController`] creates, wires, replaces and tears down sessions
//! - [`SessionLease`] is the short-lived view handed to queued jobs
//! - [`SessionState`] is the per-instance lifecycle

mod controller;
mod state;

pub use controller::{SessionController, SessionLease, SessionStatus};
pub use state::SessionState;
