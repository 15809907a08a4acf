//! CourierContext - the shared state every interface operates on.
//!
//! The HTTP server and the daemon both hold a clone of one context. Cloning
//! only clones `Arc`s, so all clones see the same session, queue and
//! correlator.
//!
//! ```text
//!          ┌──────────────────────────────────┐
//!          │          CourierContext          │
//!          ├──────────────────────────────────┤
//!          │  Messenger ──► OperationQueue    │
//!          │      │                           │
//!          │      ▼                           │
//!          │  SessionController ──► provider  │
//!          │      │                           │
//!          │      ├──► ReplyCorrelator        │
//!          │      └──► EventBus               │
//!          └──────────────────────────────────┘
//! ```

use std::sync::Arc;

use crate::config::CourierConfig;
use crate::correlator::ReplyCorrelator;
use crate::error::Result;
use crate::event_bus::EventBus;
use crate::logging::AuditLog;
use crate::messenger::Messenger;
use crate::provider::loopback::LoopbackProvider;
use crate::provider::SessionProvider;
use crate::queue::OperationQueue;
use crate::session::SessionController;

#[derive(Default)]
pub struct CourierContextBuilder {
    config: CourierConfig,
    provider: Option<Arc<dyn SessionProvider>>,
    event_bus: Option<Arc<EventBus>>,
    audit: Option<AuditLog>,
}

impl CourierContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: CourierConfig) -> Self {
        self.config = config;
        self
    }

    /// Provider backing every session. Defaults to an in-process loopback.
    pub fn provider(mut self, provider: Arc<dyn SessionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Use an existing EventBus (for testing or custom configurations).
    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Override the audit log opened from `config.log_dir`.
    pub fn audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Validate the configuration and wire the components together.
    ///
    /// Spawns the queue worker, so it must run inside a tokio runtime. No
    /// session exists until [`CourierContext::start`] is called.
    pub fn build(self) -> Result<CourierContext> {
        self.config.validate()?;

        let event_bus = self.event_bus.unwrap_or_else(|| Arc::new(EventBus::new()));
        let provider = self
            .provider
            .unwrap_or_else(|| Arc::new(LoopbackProvider::new()) as Arc<dyn SessionProvider>);
        let audit = self
            .audit
            .unwrap_or_else(|| AuditLog::open(self.config.log_dir.as_deref()));
        let correlator = ReplyCorrelator::new(self.config.reply_wait());
        let sessions = SessionController::new(
            provider,
            self.config.identity_pool(),
            Arc::clone(&event_bus),
            Arc::clone(&correlator),
            audit.clone(),
            self.config.failover_backoff(),
        )?;
        let messenger = Messenger::new(
            Arc::clone(&sessions),
            Arc::clone(&correlator),
            OperationQueue::start(),
            audit.clone(),
            self.config.clone(),
        );

        Ok(CourierContext {
            event_bus,
            sessions,
            correlator,
            messenger: Arc::new(messenger),
            audit,
            config: Arc::new(self.config),
        })
    }
}

#[derive(Clone)]
pub struct CourierContext {
    pub event_bus: Arc<EventBus>,
    pub sessions: Arc<SessionController>,
    pub correlator: Arc<ReplyCorrelator>,
    pub messenger: Arc<Messenger>,
    pub audit: AuditLog,
    config: Arc<CourierConfig>,
}

impl CourierContext {
    pub fn builder() -> CourierContextBuilder {
        CourierContextBuilder::new()
    }

    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    /// Create the first session.
    ///
    /// An initialization failure is logged and retried in the background;
    /// it is not fatal to the process.
    pub async fn start(&self) {
        if let Err(e) = self.sessions.start().await {
            log::error!("initial session failed to start: {}", e);
        }
    }

    /// Destroy the active session.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }
}
