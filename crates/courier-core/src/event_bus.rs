//! Broadcasting of session lifecycle and inbound traffic.
//!
//! The session controller publishes every notification it observes here so
//! interfaces (the WebSocket stream, logs, tests) can follow along without
//! touching the session itself.
//!
//! ```rust
//! use courier_core::event_bus::{CourierEvent, EventBus};
//!
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe();
//! bus.publish(CourierEvent::Ready { identity: "primary".into(), generation: 1 });
//! // let event = rx.recv().await.unwrap();
//! ```

use serde::Serialize;
use tokio::sync::broadcast;

use crate::provider::ChatMessage;

/// Events beyond this capacity make slow subscribers lag.
const DEFAULT_CAPACITY: usize = 1024;

/// Something observable happened to the active session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CourierEvent {
    Qr {
        identity: String,
        generation: u64,
        payload: String,
    },
    Ready {
        identity: String,
        generation: u64,
    },
    Disconnected {
        identity: String,
        generation: u64,
        reason: String,
    },
    AuthFailure {
        identity: String,
        generation: u64,
        message: String,
    },
    Failover {
        from_identity: Option<String>,
        to_identity: String,
        generation: u64,
    },
    Inbound {
        generation: u64,
        message: ChatMessage,
    },
}

impl CourierEvent {
    /// Topic string used for subscription filtering (e.g. `session:ready`).
    pub fn topic(&self) -> &'static str {
        match self {
            CourierEvent::Qr { .. } => "session:qr",
            CourierEvent::Ready { .. } => "session:ready",
            CourierEvent::Disconnected { .. } => "session:disconnected",
            CourierEvent::AuthFailure { .. } => "session:auth_failure",
            CourierEvent::Failover { .. } => "session:failover",
            CourierEvent::Inbound { .. } => "message:inbound",
        }
    }
}

pub struct EventBus {
    sender: broadcast::Sender<CourierEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers; returns how many received it.
    ///
    /// With no subscribers the event is dropped.
    pub fn publish(&self, event: CourierEvent) -> usize {
        log::trace!("event {}", event.topic());
        self.sender.send(event).unwrap_or(0)
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CourierEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
