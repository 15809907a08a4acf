//! HTTP client for an external session sidecar.
//!
//! The sidecar owns the real messaging connection and exposes it as a small
//! JSON API. Requests go out with `ureq` on the blocking pool; events come
//! back the other way, pushed by the sidecar to the courier HTTP server,
//! which hands them to [`BridgeProvider::dispatch`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;

use super::{
    ChatMessage, HistoryQuery, OutgoingContent, ProviderError, ProviderEvent, ProviderSession,
    SentMessage, SessionIdentity, SessionProvider,
};
use crate::sync::lock;
use crate::target::ChatTarget;

const EVENT_CAPACITY: usize = 256;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct CreatedSession {
    id: String,
}

struct Route {
    session_id: String,
    events: broadcast::Sender<ProviderEvent>,
}

type Routes = Arc<Mutex<HashMap<SessionIdentity, Route>>>;

pub struct BridgeProvider {
    base_url: String,
    agent: ureq::Agent,
    routes: Routes,
}

impl BridgeProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            base_url,
            agent,
            routes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Deliver an event pushed by the sidecar to the session of `identity`.
    ///
    /// `session_id` is the sidecar's id for the session that produced the
    /// event. Events from a session that has since been replaced or destroyed
    /// are dropped with `Closed`. Returns how many subscribers received it.
    pub fn dispatch(
        &self,
        identity: &SessionIdentity,
        session_id: &str,
        event: ProviderEvent,
    ) -> Result<usize, ProviderError> {
        let routes = lock(&self.routes);
        let route = routes.get(identity).ok_or(ProviderError::Closed)?;
        if route.session_id != session_id {
            log::debug!(
                "dropping bridge event {} from stale session {} (current for {} is {})",
                event.name(),
                session_id,
                identity,
                route.session_id
            );
            return Err(ProviderError::Closed);
        }
        log::debug!("bridge event {} for {} ({})", event.name(), identity, session_id);
        Ok(route.events.send(event).unwrap_or(0))
    }
}

#[async_trait]
impl SessionProvider for BridgeProvider {
    async fn create(
        &self,
        identity: &SessionIdentity,
    ) -> Result<Arc<dyn ProviderSession>, ProviderError> {
        let agent = self.agent.clone();
        let url = format!("{}/sessions", self.base_url);
        let body = json!({ "identity": identity.as_str() });
        let created: CreatedSession = blocking(move || {
            let response = agent.post(&url).send_json(body).map_err(map_error)?;
            response.into_json().map_err(decode_error)
        })
        .await?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        lock(&self.routes).insert(
            identity.clone(),
            Route {
                session_id: created.id.clone(),
                events: events.clone(),
            },
        );
        log::info!("bridge session {} created for {}", created.id, identity);

        Ok(Arc::new(BridgeSession {
            identity: identity.clone(),
            session_url: format!("{}/sessions/{}", self.base_url, created.id),
            session_id: created.id,
            agent: self.agent.clone(),
            events,
            routes: Arc::clone(&self.routes),
        }))
    }
}

struct BridgeSession {
    identity: SessionIdentity,
    session_id: String,
    session_url: String,
    agent: ureq::Agent,
    events: broadcast::Sender<ProviderEvent>,
    routes: Routes,
}

#[async_trait]
impl ProviderSession for BridgeSession {
    fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        let agent = self.agent.clone();
        let url = format!("{}/initialize", self.session_url);
        blocking(move || {
            agent.post(&url).call().map_err(map_error)?;
            Ok(())
        })
        .await
    }

    async fn send_message(
        &self,
        target: &ChatTarget,
        content: OutgoingContent,
    ) -> Result<SentMessage, ProviderError> {
        let agent = self.agent.clone();
        let url = format!("{}/messages", self.session_url);
        let body = json!({ "target": target, "content": content });
        blocking(move || {
            let response = agent.post(&url).send_json(body).map_err(map_error)?;
            response.into_json().map_err(decode_error)
        })
        .await
    }

    async fn fetch_messages(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<ChatMessage>, ProviderError> {
        let agent = self.agent.clone();
        let url = format!(
            "{}/chats/{}/messages",
            self.session_url,
            query.conversation.as_str()
        );
        let limit = query.limit.to_string();
        blocking(move || {
            let response = agent
                .get(&url)
                .query("limit", &limit)
                .call()
                .map_err(map_error)?;
            response.into_json().map_err(decode_error)
        })
        .await
    }

    async fn destroy(&self) -> Result<(), ProviderError> {
        {
            let mut routes = lock(&self.routes);
            if routes
                .get(&self.identity)
                .is_some_and(|r| r.session_id == self.session_id)
            {
                routes.remove(&self.identity);
            }
        }

        let agent = self.agent.clone();
        let url = self.session_url.clone();
        blocking(move || {
            agent.delete(&url).call().map_err(map_error)?;
            Ok(())
        })
        .await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, ProviderError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ProviderError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProviderError::Transport(format!("bridge request aborted: {e}")))?
}

fn map_error(err: ureq::Error) -> ProviderError {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            ProviderError::Rejected(format!("bridge returned {code}: {}", body.trim()))
        }
        ureq::Error::Transport(transport) => ProviderError::Transport(transport.to_string()),
    }
}

fn decode_error(err: std::io::Error) -> ProviderError {
    ProviderError::Transport(format!("invalid bridge response: {err}"))
}
