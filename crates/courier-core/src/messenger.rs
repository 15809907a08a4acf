//! Outbound operations.
//!
//! [`Messenger`] is what interfaces call. It validates input at the boundary,
//! then runs every session operation as a job on the [`OperationQueue`]:
//! each job passes the readiness gate, uses the session it was handed, and
//! reports provider faults back to the [`SessionController`] so the next job
//! runs on a replacement.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::DateTime;
use serde::Serialize;

use crate::config::CourierConfig;
use crate::correlator::{ReplyCorrelator, ReplyOutcome};
use crate::error::{CourierError, Result};
use crate::logging::{AuditLog, Direction};
use crate::provider::{ChatMessage, HistoryQuery, OutgoingContent, SentMessage};
use crate::queue::OperationQueue;
use crate::session::{SessionController, SessionLease, SessionState};
use crate::target::ChatTarget;

pub const DEFAULT_HISTORY_LIMIT: usize = 20;
pub const MAX_HISTORY_LIMIT: usize = 100;
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// What callers get back after a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    pub id: String,
    pub ack: i32,
    pub from: String,
    pub to: String,
    /// Provider timestamp, UTC, `YYYY-MM-DD HH:MM:SS`.
    pub time: String,
}

impl SendReceipt {
    pub fn from_sent(sent: &SentMessage) -> Self {
        Self {
            id: sent.message_id.clone(),
            ack: sent.ack,
            from: user_part(&sent.sender).to_string(),
            to: user_part(&sent.receiver).to_string(),
            time: format_timestamp(sent.timestamp),
        }
    }
}

fn user_part(chat_id: &str) -> &str {
    chat_id.split('@').next().unwrap_or(chat_id)
}

fn format_timestamp(unix: i64) -> String {
    DateTime::from_timestamp(unix, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| unix.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub ready: bool,
    pub state: SessionState,
    pub identity: Option<String>,
    pub generation: u64,
    pub queued_jobs: usize,
    pub pending_waits: usize,
    pub cached_replies: usize,
    pub qr_pending: bool,
}

pub struct Messenger {
    controller: Arc<SessionController>,
    correlator: Arc<ReplyCorrelator>,
    queue: OperationQueue,
    audit: AuditLog,
    config: CourierConfig,
}

impl Messenger {
    pub fn new(
        controller: Arc<SessionController>,
        correlator: Arc<ReplyCorrelator>,
        queue: OperationQueue,
        audit: AuditLog,
        config: CourierConfig,
    ) -> Self {
        Self {
            controller,
            correlator,
            queue,
            audit,
            config,
        }
    }

    pub fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    pub async fn send_text(&self, target: &str, body: &str) -> Result<SendReceipt> {
        let target = self.parse_target(target)?;
        let body = required(body, "body")?;
        self.deliver(target, OutgoingContent::Text { body }, false)
            .await
            .map(|sent| SendReceipt::from_sent(&sent))
    }

    pub async fn send_file(
        &self,
        target: &str,
        data: Vec<u8>,
        mime_type: Option<String>,
        filename: Option<String>,
        caption: Option<String>,
    ) -> Result<SendReceipt> {
        let target = self.parse_target(target)?;
        if data.is_empty() {
            return Err(CourierError::Validation("file is empty".to_string()));
        }
        let content = OutgoingContent::Media {
            data,
            mime_type: mime_type
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            filename: filename.filter(|f| !f.trim().is_empty()),
            caption: caption.filter(|c| !c.trim().is_empty()),
        };
        self.deliver(target, content, false)
            .await
            .map(|sent| SendReceipt::from_sent(&sent))
    }

    /// Send a map link for the given coordinates.
    pub async fn send_location(
        &self,
        target: &str,
        lat: f64,
        lon: f64,
        description: Option<&str>,
    ) -> Result<SendReceipt> {
        let target = self.parse_target(target)?;
        let body = location_text(lat, lon, description)?;
        self.deliver(target, OutgoingContent::Text { body }, false)
            .await
            .map(|sent| SendReceipt::from_sent(&sent))
    }

    /// Send text and start waiting for the first reply on that conversation.
    ///
    /// The wait is registered inside the job, right after the provider
    /// accepted the message, so a fast reply cannot slip past it.
    pub async fn send_and_wait(&self, target: &str, body: &str) -> Result<SendReceipt> {
        let target = self.parse_target(target)?;
        let body = required(body, "body")?;
        self.deliver(target, OutgoingContent::Text { body }, true)
            .await
            .map(|sent| SendReceipt::from_sent(&sent))
    }

    /// Wait for the reply to a message sent with [`Self::send_and_wait`].
    pub async fn reply_status(&self, message_id: &str) -> Result<ReplyOutcome> {
        let message_id = required(message_id, "message id")?;
        self.correlator.await_reply(&message_id).await
    }

    /// Most recent messages of one conversation, oldest first.
    pub async fn recent_messages(
        &self,
        target: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ChatMessage>> {
        let conversation = self.parse_target(target)?;
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        if !(1..=MAX_HISTORY_LIMIT).contains(&limit) {
            return Err(CourierError::Validation(format!(
                "limit must be between 1 and {MAX_HISTORY_LIMIT}"
            )));
        }
        let query = HistoryQuery {
            conversation,
            limit,
        };
        self.run("history", move |lease| async move {
            Ok(lease.handle.fetch_messages(&query).await?)
        })
        .await
    }

    pub fn health(&self) -> Health {
        let status = self.controller.status();
        Health {
            ready: status.state.is_ready(),
            state: status.state,
            identity: status.identity,
            generation: status.generation,
            queued_jobs: self.queue.pending(),
            pending_waits: self.correlator.pending_count(),
            cached_replies: self.correlator.cached_count(),
            qr_pending: status.qr_pending,
        }
    }

    fn parse_target(&self, raw: &str) -> Result<ChatTarget> {
        ChatTarget::parse(raw, self.config.default_country_code.as_deref())
    }

    async fn deliver(
        &self,
        target: ChatTarget,
        content: OutgoingContent,
        await_reply: bool,
    ) -> Result<SentMessage> {
        let audit = self.audit.clone();
        let correlator = await_reply.then(|| Arc::clone(&self.correlator));
        self.run("send", move |lease| async move {
            let summary = content.summary();
            let sent = lease.handle.send_message(&target, content).await?;
            if let Some(correlator) = correlator {
                correlator.register_wait(target.as_str(), &sent.message_id);
            }
            audit.record(Direction::Outbound, target.as_str(), &summary);
            log::info!(
                "sent {} to {} via {} (generation {})",
                sent.message_id,
                target,
                lease.identity,
                lease.generation
            );
            Ok(sent)
        })
        .await
    }

    /// Enqueue `work` behind the readiness gate.
    ///
    /// A `SessionFault` raised by `work` flags its session and schedules a
    /// failover from inside the job, so it happens even if the caller gave
    /// up. Timeouts trigger failover only under `FailoverPolicy::AnyFailure`.
    ///
    /// The gate never outlives the job budget, and a job whose caller was
    /// already answered with `Timeout` does not start `work`.
    async fn run<T, F, Fut>(&self, op: &'static str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(SessionLease) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let controller = Arc::clone(&self.controller);
        let gate_timeout = self.config.gate_timeout();
        let used = Arc::new(AtomicU64::new(0));
        let used_by_job = Arc::clone(&used);

        let result = self
            .queue
            .enqueue(
                move |ticket| async move {
                    let lease = controller.wait_until_ready(gate_timeout).await?;
                    if let Err(e) = ticket.ensure_live() {
                        log::warn!(
                            "{} dropped: job {} was abandoned at the readiness gate",
                            op,
                            ticket.id()
                        );
                        return Err(e);
                    }
                    let generation = lease.generation;
                    used_by_job.store(generation, Ordering::SeqCst);
                    match work(lease).await {
                        Err(e) if e.is_session_fault() => {
                            log::warn!("{} failed on generation {}: {}", op, generation, e);
                            controller.mark_faulted(generation);
                            controller.spawn_failover_from(generation);
                            Err(e)
                        }
                        other => other,
                    }
                },
                self.config.job_timeout(),
            )
            .await;

        if let Err(e) = &result {
            if e.is_timeout() && self.config.failover_policy.triggers_on(e) {
                let generation = match used.load(Ordering::SeqCst) {
                    0 => self.controller.generation(),
                    g => g,
                };
                log::warn!("{} timed out on generation {}; failing over", op, generation);
                self.controller.mark_faulted(generation);
                self.controller.spawn_failover_from(generation);
            }
        }
        result
    }
}

fn required(value: &str, field: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CourierError::Validation(format!("{field} is required")));
    }
    Ok(value.to_string())
}

fn location_text(lat: f64, lon: f64, description: Option<&str>) -> Result<String> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(CourierError::Validation(
            "lat must be between -90 and 90".to_string(),
        ));
    }
    if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
        return Err(CourierError::Validation(
            "lon must be between -180 and 180".to_string(),
        ));
    }
    let link = format!("https://maps.google.com/?q={lat},{lon}");
    Ok(match description.map(str::trim).filter(|d| !d.is_empty()) {
        Some(description) => format!("{description}\n{link}"),
        None => link,
    })
}
