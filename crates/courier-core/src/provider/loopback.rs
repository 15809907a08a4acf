//! In-process provider.
//!
//! Sessions live entirely in memory: sends are recorded and acknowledged,
//! inbound traffic and disconnects are injected by the caller. A shared
//! [`LoopbackScript`] lets tests make future sessions misbehave (failed
//! sends, hung sends, failed initialization) before failover creates them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{
    ChatMessage, HistoryQuery, OutgoingContent, ProviderError, ProviderEvent, ProviderSession,
    SentMessage, SessionIdentity, SessionProvider,
};
use crate::sync::lock;
use crate::target::ChatTarget;

const EVENT_CAPACITY: usize = 256;

/// Knobs shared by a provider and every session it creates.
#[derive(Debug)]
pub struct LoopbackScript {
    /// Emit `qr` then `ready` from `initialize`.
    pub auto_ready: bool,
    pub failing_initializations: usize,
    pub failing_sends: usize,
    pub hanging_sends: usize,
    pub failing_destroys: usize,
    /// Ids handed out to the next sends, before falling back to random ids.
    pub message_ids: VecDeque<String>,
    /// Fixed timestamp for sends, instead of the wall clock.
    pub timestamp: Option<i64>,
}

impl Default for LoopbackScript {
    fn default() -> Self {
        Self {
            auto_ready: true,
            failing_initializations: 0,
            failing_sends: 0,
            hanging_sends: 0,
            failing_destroys: 0,
            message_ids: VecDeque::new(),
            timestamp: None,
        }
    }
}

/// A message accepted by a loopback session.
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub target: ChatTarget,
    pub content: OutgoingContent,
    pub receipt: SentMessage,
}

#[derive(Default)]
pub struct LoopbackProvider {
    script: Arc<Mutex<LoopbackScript>>,
    sessions: Mutex<Vec<Arc<LoopbackSession>>>,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the shared script.
    pub fn script<R>(&self, f: impl FnOnce(&mut LoopbackScript) -> R) -> R {
        f(&mut lock(&self.script))
    }

    pub fn fail_next_sends(&self, count: usize) {
        self.script(|s| s.failing_sends += count);
    }

    pub fn hang_next_sends(&self, count: usize) {
        self.script(|s| s.hanging_sends += count);
    }

    pub fn fail_next_initializations(&self, count: usize) {
        self.script(|s| s.failing_initializations += count);
    }

    pub fn queue_message_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script(|s| s.message_ids.extend(ids.into_iter().map(Into::into)));
    }

    /// Every session created so far, oldest first.
    pub fn sessions(&self) -> Vec<Arc<LoopbackSession>> {
        lock(&self.sessions).clone()
    }

    pub fn latest(&self) -> Option<Arc<LoopbackSession>> {
        lock(&self.sessions).last().cloned()
    }
}

#[async_trait]
impl SessionProvider for LoopbackProvider {
    async fn create(
        &self,
        identity: &SessionIdentity,
    ) -> Result<Arc<dyn ProviderSession>, ProviderError> {
        let session = Arc::new(LoopbackSession::new(
            identity.clone(),
            Arc::clone(&self.script),
        ));
        lock(&self.sessions).push(Arc::clone(&session));
        log::debug!("loopback session created for identity {}", identity);
        Ok(session)
    }
}

pub struct LoopbackSession {
    identity: SessionIdentity,
    me: String,
    events: broadcast::Sender<ProviderEvent>,
    script: Arc<Mutex<LoopbackScript>>,
    sent: Mutex<Vec<SentRecord>>,
    history: Mutex<Vec<ChatMessage>>,
    destroyed: AtomicBool,
}

impl LoopbackSession {
    fn new(identity: SessionIdentity, script: Arc<Mutex<LoopbackScript>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            me: format!("{}@c.us", identity),
            identity,
            events,
            script,
            sent: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    /// The local account's chat id.
    pub fn me(&self) -> &str {
        &self.me
    }

    /// Push an arbitrary event to subscribers. Returns how many received it.
    pub fn emit(&self, event: ProviderEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }

    pub fn become_ready(&self) -> usize {
        self.emit(ProviderEvent::Ready)
    }

    pub fn disconnect(&self, reason: &str) -> usize {
        self.emit(ProviderEvent::Disconnected {
            reason: reason.to_string(),
        })
    }

    /// Simulate an inbound message from `from`.
    pub fn receive(&self, from: &str, body: &str) -> ChatMessage {
        let message = ChatMessage {
            id: format!("in-{}", Uuid::new_v4().simple()),
            from: from.to_string(),
            to: self.me.clone(),
            body: body.to_string(),
            timestamp: Utc::now().timestamp(),
            from_me: false,
        };
        lock(&self.history).push(message.clone());
        self.emit(ProviderEvent::Message {
            message: message.clone(),
        });
        message
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        lock(&self.sent).clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

enum SendPlan {
    Deliver { id: Option<String>, timestamp: i64 },
    Fail,
    Hang,
}

#[async_trait]
impl ProviderSession for LoopbackSession {
    fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        let auto_ready = {
            let mut script = lock(&self.script);
            if script.failing_initializations > 0 {
                script.failing_initializations -= 1;
                return Err(ProviderError::Rejected(
                    "scripted initialization failure".to_string(),
                ));
            }
            script.auto_ready
        };

        self.emit(ProviderEvent::Qr {
            payload: format!("loopback:{}", self.identity),
        });
        if auto_ready {
            self.become_ready();
        }
        Ok(())
    }

    async fn send_message(
        &self,
        target: &ChatTarget,
        content: OutgoingContent,
    ) -> Result<SentMessage, ProviderError> {
        if self.is_destroyed() {
            return Err(ProviderError::Closed);
        }

        let plan = {
            let mut script = lock(&self.script);
            if script.hanging_sends > 0 {
                script.hanging_sends -= 1;
                SendPlan::Hang
            } else if script.failing_sends > 0 {
                script.failing_sends -= 1;
                SendPlan::Fail
            } else {
                SendPlan::Deliver {
                    id: script.message_ids.pop_front(),
                    timestamp: script.timestamp.unwrap_or_else(|| Utc::now().timestamp()),
                }
            }
        };

        let (id, timestamp) = match plan {
            SendPlan::Hang => {
                futures::future::pending::<()>().await;
                return Err(ProviderError::Closed);
            }
            SendPlan::Fail => {
                return Err(ProviderError::Rejected("scripted send failure".to_string()))
            }
            SendPlan::Deliver { id, timestamp } => (id, timestamp),
        };

        let receipt = SentMessage {
            message_id: id.unwrap_or_else(|| Uuid::new_v4().simple().to_string().to_uppercase()),
            ack: 1,
            timestamp,
            sender: self.me.clone(),
            receiver: target.as_str().to_string(),
        };

        let body = match &content {
            OutgoingContent::Text { body } => body.clone(),
            OutgoingContent::Media { caption, .. } => caption.clone().unwrap_or_default(),
        };
        lock(&self.history).push(ChatMessage {
            id: receipt.message_id.clone(),
            from: self.me.clone(),
            to: receipt.receiver.clone(),
            body,
            timestamp,
            from_me: true,
        });
        lock(&self.sent).push(SentRecord {
            target: target.clone(),
            content,
            receipt: receipt.clone(),
        });

        Ok(receipt)
    }

    async fn fetch_messages(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<ChatMessage>, ProviderError> {
        if self.is_destroyed() {
            return Err(ProviderError::Closed);
        }
        let history = lock(&self.history);
        let matching: Vec<_> = history
            .iter()
            .filter(|m| m.conversation() == query.conversation.as_str())
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(query.limit);
        Ok(matching.into_iter().skip(skip).collect())
    }

    async fn destroy(&self) -> Result<(), ProviderError> {
        self.destroyed.store(true, Ordering::SeqCst);
        let mut script = lock(&self.script);
        if script.failing_destroys > 0 {
            script.failing_destroys -= 1;
            return Err(ProviderError::Rejected("scripted destroy failure".to_string()));
        }
        Ok(())
    }
}
