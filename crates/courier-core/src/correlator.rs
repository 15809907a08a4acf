//! Reply correlation.
//!
//! Bridges the inbound-message stream to on-demand lookups: after an outbound
//! message is sent with [`ReplyCorrelator::register_wait`], the first inbound
//! message on the same conversation becomes that message's reply. Callers
//! block in [`ReplyCorrelator::await_reply`] until the reply arrives or the
//! wait deadline fires.
//!
//! Only the most recent registration for a conversation receives replies.
//! Superseded registrations keep their own deadline and resolve as timed out.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{CourierError, Result};
use crate::provider::ChatMessage;
use crate::sync::lock;

pub const DEFAULT_REPLY_WAIT: Duration = Duration::from_secs(300);

/// First inbound message observed after an outbound one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    #[serde(rename = "message")]
    pub body: String,
    pub from: String,
    /// Unix seconds, as reported by the provider.
    pub timestamp: i64,
    /// Id of the inbound message.
    pub message_id: String,
    /// Id of the outbound message this answers.
    pub in_reply_to: String,
}

/// Result of waiting on a registered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Replied(Reply),
    /// The deadline fired before any reply was attributed to the message.
    TimedOut,
}

struct PendingWait {
    conversation: String,
    waiters: Vec<oneshot::Sender<Option<Reply>>>,
    deadline: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    /// conversation -> outbound message id currently receiving replies
    by_conversation: HashMap<String, String>,
    pending: HashMap<String, PendingWait>,
    replies: HashMap<String, Reply>,
    expired: HashSet<String>,
}

pub struct ReplyCorrelator {
    state: Mutex<State>,
    wait: Duration,
}

impl ReplyCorrelator {
    pub fn new(wait: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            wait,
        })
    }

    /// Attribute the next inbound message on `conversation` to `message_id`.
    ///
    /// Supersedes any earlier registration for the same conversation and
    /// starts this registration's deadline timer. Requires a tokio runtime.
    pub fn register_wait(self: &Arc<Self>, conversation: &str, message_id: &str) {
        let deadline = self.spawn_deadline(message_id.to_string());

        let mut state = lock(&self.state);
        state.expired.remove(message_id);
        let previous = state
            .by_conversation
            .insert(conversation.to_string(), message_id.to_string());

        match state.pending.get_mut(message_id) {
            Some(wait) => {
                if let Some(old) = wait.deadline.replace(deadline) {
                    old.abort();
                }
                wait.conversation = conversation.to_string();
            }
            None => {
                state.pending.insert(
                    message_id.to_string(),
                    PendingWait {
                        conversation: conversation.to_string(),
                        waiters: Vec::new(),
                        deadline: Some(deadline),
                    },
                );
            }
        }
        drop(state);

        match previous {
            Some(prev) if prev != message_id => log::debug!(
                "wait on {} registered for {}, superseding {}",
                conversation,
                message_id,
                prev
            ),
            _ => log::debug!("wait on {} registered for {}", conversation, message_id),
        }
    }

    /// Feed one inbound message. Returns the outbound id it resolved, if any.
    ///
    /// Messages sent by the local account and messages on conversations with
    /// no registration are ignored.
    pub fn on_inbound_message(&self, message: &ChatMessage) -> Option<String> {
        if message.from_me {
            return None;
        }
        let conversation = message.conversation();

        let mut state = lock(&self.state);
        let message_id = state.by_conversation.remove(conversation)?;
        let wait = state.pending.remove(&message_id)?;

        let reply = Reply {
            body: message.body.clone(),
            from: message.from.clone(),
            timestamp: message.timestamp,
            message_id: message.id.clone(),
            in_reply_to: message_id.clone(),
        };
        state.replies.insert(message_id.clone(), reply.clone());
        drop(state);

        if let Some(deadline) = wait.deadline {
            deadline.abort();
        }
        let woken = wait.waiters.len();
        for waiter in wait.waiters {
            let _ = waiter.send(Some(reply.clone()));
        }
        log::info!(
            "reply from {} attributed to {} ({} waiter(s))",
            conversation,
            message_id,
            woken
        );
        Some(message_id)
    }

    /// Wait for the reply to `message_id`.
    ///
    /// Returns at once when the reply is cached or the wait already expired;
    /// fails with `NotFound` when the id was never registered.
    pub async fn await_reply(&self, message_id: &str) -> Result<ReplyOutcome> {
        let rx = {
            let mut state = lock(&self.state);
            if let Some(reply) = state.replies.get(message_id) {
                return Ok(ReplyOutcome::Replied(reply.clone()));
            }
            if state.expired.contains(message_id) {
                return Ok(ReplyOutcome::TimedOut);
            }
            let Some(wait) = state.pending.get_mut(message_id) else {
                return Err(CourierError::NotFound(format!(
                    "no message awaiting a reply with id {message_id}"
                )));
            };
            let (tx, rx) = oneshot::channel();
            wait.waiters.push(tx);
            rx
        };

        match rx.await {
            Ok(Some(reply)) => Ok(ReplyOutcome::Replied(reply)),
            Ok(None) | Err(_) => Ok(ReplyOutcome::TimedOut),
        }
    }

    /// Registrations still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn cached_count(&self) -> usize {
        lock(&self.state).replies.len()
    }

    fn spawn_deadline(self: &Arc<Self>, message_id: String) -> JoinHandle<()> {
        let correlator: Weak<Self> = Arc::downgrade(self);
        let wait = self.wait;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(correlator) = correlator.upgrade() {
                correlator.expire(&message_id);
            }
        })
    }

    fn expire(&self, message_id: &str) {
        let mut state = lock(&self.state);
        let Some(wait) = state.pending.remove(message_id) else {
            return;
        };
        if state.by_conversation.get(&wait.conversation).map(String::as_str) == Some(message_id)
        {
            state.by_conversation.remove(&wait.conversation);
        }
        state.expired.insert(message_id.to_string());
        drop(state);

        log::info!(
            "wait for {} on {} expired without a reply",
            message_id,
            wait.conversation
        );
        for waiter in wait.waiters {
            let _ = waiter.send(None);
        }
    }
}
