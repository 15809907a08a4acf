//! Session creation, event wiring and failover.
//!
//! Exactly one session is current at any instant. Each installed session gets
//! a fresh generation number; fault reports carry the generation they were
//! observed on so a fault raised by an already-replaced session never causes
//! a second swap.
//!
//! Jobs never keep a session across suspension points: they take a
//! [`SessionLease`] from [`SessionController::wait_until_ready`] at execution
//! time and drop it when they settle.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::SessionState;
use crate::correlator::ReplyCorrelator;
use crate::error::{CourierError, Result};
use crate::event_bus::{CourierEvent, EventBus};
use crate::logging::{AuditLog, Direction};
use crate::provider::{ProviderEvent, ProviderSession, SessionIdentity, SessionProvider};
use crate::sync::lock;

/// Borrowed view of the current session, valid for one job.
#[derive(Clone)]
pub struct SessionLease {
    pub generation: u64,
    pub identity: SessionIdentity,
    pub handle: Arc<dyn ProviderSession>,
    state: watch::Receiver<SessionState>,
}

impl SessionLease {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }
}

/// Point-in-time summary used by health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub identity: Option<String>,
    pub generation: u64,
    pub qr_pending: bool,
}

/// Aborts the event pump of a session when dropped.
struct EventSubscription(JoinHandle<()>);

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct ActiveSession {
    generation: u64,
    identity: SessionIdentity,
    handle: Arc<dyn ProviderSession>,
    state: Arc<watch::Sender<SessionState>>,
    events: EventSubscription,
}

impl ActiveSession {
    fn lease(&self) -> SessionLease {
        SessionLease {
            generation: self.generation,
            identity: self.identity.clone(),
            handle: Arc::clone(&self.handle),
            state: self.state.subscribe(),
        }
    }
}

fn transition(state: &watch::Sender<SessionState>, next: SessionState) -> bool {
    state.send_if_modified(|current| {
        if current.can_transition_to(next) {
            *current = next;
            true
        } else {
            false
        }
    })
}

pub struct SessionController {
    provider: Arc<dyn SessionProvider>,
    identities: Vec<SessionIdentity>,
    bus: Arc<EventBus>,
    correlator: Arc<ReplyCorrelator>,
    audit: AuditLog,
    backoff: Duration,
    current: Mutex<Option<ActiveSession>>,
    /// Serializes start, failover and shutdown.
    failover_lock: tokio::sync::Mutex<()>,
    index: Mutex<usize>,
    generation: watch::Sender<u64>,
    last_qr: Mutex<Option<String>>,
}

impl SessionController {
    /// `backoff` delays the replacement of a session whose creation or
    /// initialization failed.
    pub fn new(
        provider: Arc<dyn SessionProvider>,
        identities: Vec<SessionIdentity>,
        bus: Arc<EventBus>,
        correlator: Arc<ReplyCorrelator>,
        audit: AuditLog,
        backoff: Duration,
    ) -> Result<Arc<Self>> {
        if identities.is_empty() {
            return Err(CourierError::Validation(
                "session identity pool is empty".to_string(),
            ));
        }
        let (generation, _) = watch::channel(0);
        Ok(Arc::new(Self {
            provider,
            identities,
            bus,
            correlator,
            audit,
            backoff,
            current: Mutex::new(None),
            failover_lock: tokio::sync::Mutex::new(()),
            index: Mutex::new(0),
            generation,
            last_qr: Mutex::new(None),
        }))
    }

    /// Create and initialize the session for the first pool identity.
    ///
    /// No-op when a session already exists.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let _guard = self.failover_lock.lock().await;
        if lock(&self.current).is_some() {
            return Ok(());
        }
        self.install(0, None).await
    }

    /// Replace the current session with one for the next pool identity.
    pub async fn failover(self: &Arc<Self>) -> Result<()> {
        let _guard = self.failover_lock.lock().await;
        self.swap().await
    }

    /// Fail over only if `generation` is still current.
    ///
    /// Returns whether a swap happened.
    pub async fn failover_from(self: &Arc<Self>, generation: u64) -> Result<bool> {
        let _guard = self.failover_lock.lock().await;
        let current = self.generation();
        if current != generation {
            log::debug!(
                "ignoring failover request for generation {} (current is {})",
                generation,
                current
            );
            return Ok(false);
        }
        self.swap().await.map(|_| true)
    }

    /// Run [`Self::failover_from`] in the background.
    pub fn spawn_failover_from(self: &Arc<Self>, generation: u64) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = controller.failover_from(generation).await {
                log::error!("failover from generation {} failed: {}", generation, e);
            }
        });
    }

    /// Flag the session of `generation` as unusable so later jobs wait for
    /// its replacement instead of reusing it.
    pub fn mark_faulted(&self, generation: u64) {
        let current = lock(&self.current);
        if let Some(session) = current.as_ref().filter(|s| s.generation == generation) {
            if transition(&session.state, SessionState::Disconnected) {
                log::warn!(
                    "session {} (generation {}) marked faulted",
                    session.identity,
                    generation
                );
            }
        }
    }

    /// The current session, whatever its state.
    pub fn current(&self) -> Result<SessionLease> {
        lock(&self.current)
            .as_ref()
            .map(ActiveSession::lease)
            .ok_or(CourierError::NotInitialized)
    }

    /// Readiness gate: wait until the current session is `ready`.
    ///
    /// Follows swaps that happen during the wait. Fails with `Timeout` once
    /// `timeout` elapses.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<SessionLease> {
        let mut generations = self.generation.subscribe();
        let gate = async {
            loop {
                let _ = generations.borrow_and_update();
                match self.current() {
                    Ok(lease) => {
                        let mut state = lease.state.clone();
                        let reached = state
                            .wait_for(|s| matches!(s, SessionState::Ready | SessionState::Destroyed))
                            .await
                            .map(|s| *s);
                        if let Ok(SessionState::Ready) = reached {
                            return Ok(lease);
                        }
                    }
                    Err(_) => {
                        if generations.changed().await.is_err() {
                            return Err(CourierError::Internal(
                                "session controller dropped".to_string(),
                            ));
                        }
                    }
                }
            }
        };

        tokio::time::timeout(timeout, gate).await.map_err(|_| {
            CourierError::Timeout(format!("session not ready after {timeout:?}"))
        })?
    }

    /// Generation of the current session; 0 before the first one.
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Latest QR payload of the current session, until it becomes ready.
    pub fn last_qr(&self) -> Option<String> {
        lock(&self.last_qr).clone()
    }

    pub fn status(&self) -> SessionStatus {
        let (state, identity) = match lock(&self.current).as_ref() {
            Some(session) => (*session.state.borrow(), Some(session.identity.to_string())),
            None => (SessionState::Uninitialized, None),
        };
        SessionStatus {
            state,
            identity,
            generation: self.generation(),
            qr_pending: lock(&self.last_qr).is_some(),
        }
    }

    /// Destroy the current session and wait for the provider to confirm.
    pub async fn shutdown(&self) {
        let _guard = self.failover_lock.lock().await;
        let Some(session) = lock(&self.current).take() else {
            return;
        };
        session.state.send_replace(SessionState::Destroyed);
        let ActiveSession {
            generation,
            identity,
            handle,
            events,
            ..
        } = session;
        drop(events);
        match handle.destroy().await {
            Ok(()) => log::info!("session {} (generation {}) shut down", identity, generation),
            Err(e) => log::warn!("shutting down session {} failed: {}", identity, e),
        }
    }

    async fn swap(self: &Arc<Self>) -> Result<()> {
        let old = lock(&self.current).take();
        let from = old.as_ref().map(|s| s.identity.clone());
        if let Some(old) = old {
            self.retire(old);
        }

        let index = {
            let mut index = lock(&self.index);
            *index = (*index + 1) % self.identities.len();
            *index
        };
        log::info!(
            "failing over from {} to {}",
            from.as_ref().map(|i| i.as_str()).unwrap_or("<none>"),
            self.identities[index]
        );
        self.install(index, from).await
    }

    /// Best-effort teardown; never blocks the caller.
    fn retire(&self, old: ActiveSession) {
        old.state.send_replace(SessionState::Destroyed);
        let ActiveSession {
            generation,
            identity,
            handle,
            events,
            ..
        } = old;
        drop(events);
        tokio::spawn(async move {
            match handle.destroy().await {
                Ok(()) => log::info!("session {} (generation {}) destroyed", identity, generation),
                Err(e) => log::warn!(
                    "destroying session {} (generation {}) failed: {}",
                    identity,
                    generation,
                    e
                ),
            }
        });
    }

    async fn install(
        self: &Arc<Self>,
        index: usize,
        from: Option<SessionIdentity>,
    ) -> Result<()> {
        let identity = self.identities[index].clone();
        *lock(&self.index) = index;

        let handle = match self.provider.create(&identity).await {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("creating session {} failed: {}", identity, e);
                self.schedule_retry(self.generation());
                return Err(e.into());
            }
        };

        let generation = self.generation() + 1;
        let (state, _) = watch::channel(SessionState::Connecting);
        let state = Arc::new(state);

        // Subscribe before initialize so the first qr/ready are not missed.
        let events = handle.subscribe();
        let pump = tokio::spawn(pump_events(
            Arc::downgrade(self),
            generation,
            identity.clone(),
            events,
            Arc::clone(&state),
        ));

        *lock(&self.last_qr) = None;
        *lock(&self.current) = Some(ActiveSession {
            generation,
            identity: identity.clone(),
            handle: Arc::clone(&handle),
            state: Arc::clone(&state),
            events: EventSubscription(pump),
        });
        self.generation.send_replace(generation);
        log::info!("session {} installed as generation {}", identity, generation);
        self.bus.publish(CourierEvent::Failover {
            from_identity: from.map(|i| i.0),
            to_identity: identity.to_string(),
            generation,
        });

        if let Err(e) = handle.initialize().await {
            log::error!("initializing session {} failed: {}", identity, e);
            transition(&state, SessionState::Disconnected);
            self.schedule_retry(generation);
            return Err(e.into());
        }
        Ok(())
    }

    fn schedule_retry(self: &Arc<Self>, generation: u64) {
        let controller = Arc::downgrade(self);
        let backoff = self.backoff;
        log::info!("retrying failover in {:?}", backoff);
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            if let Some(controller) = controller.upgrade() {
                if let Err(e) = controller.failover_from(generation).await {
                    log::error!("failover retry failed: {}", e);
                }
            }
        });
    }

    fn handle_event(
        self: &Arc<Self>,
        generation: u64,
        identity: &SessionIdentity,
        state: &watch::Sender<SessionState>,
        event: ProviderEvent,
    ) {
        log::debug!("session {} event {}", identity, event.name());
        let name = identity.to_string();
        match event {
            ProviderEvent::Qr { payload } => {
                *lock(&self.last_qr) = Some(payload.clone());
                log::info!("session {} is waiting for QR pairing", identity);
                self.bus.publish(CourierEvent::Qr {
                    identity: name,
                    generation,
                    payload,
                });
            }
            ProviderEvent::Ready => {
                if transition(state, SessionState::Ready) {
                    *lock(&self.last_qr) = None;
                    log::info!("session {} (generation {}) ready", identity, generation);
                    self.bus.publish(CourierEvent::Ready {
                        identity: name,
                        generation,
                    });
                }
            }
            ProviderEvent::Disconnected { reason } => {
                transition(state, SessionState::Disconnected);
                log::warn!("session {} disconnected: {}", identity, reason);
                self.bus.publish(CourierEvent::Disconnected {
                    identity: name,
                    generation,
                    reason,
                });
                // Runs outside this pump, which failover aborts.
                self.spawn_failover_from(generation);
            }
            ProviderEvent::AuthFailure { message } => {
                log::error!("session {} authentication failed: {}", identity, message);
                self.bus.publish(CourierEvent::AuthFailure {
                    identity: name,
                    generation,
                    message,
                });
            }
            ProviderEvent::Message { message } => {
                if !message.from_me {
                    self.audit
                        .record(Direction::Inbound, message.conversation(), &message.body);
                }
                self.correlator.on_inbound_message(&message);
                self.bus.publish(CourierEvent::Inbound {
                    generation,
                    message,
                });
            }
        }
    }
}

async fn pump_events(
    controller: Weak<SessionController>,
    generation: u64,
    identity: SessionIdentity,
    mut events: broadcast::Receiver<ProviderEvent>,
    state: Arc<watch::Sender<SessionState>>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("session {} event pump lagged by {} events", identity, skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.handle_event(generation, &identity, &state, event);
    }
    log::debug!("event pump for session {} (generation {}) stopped", identity, generation);
}
