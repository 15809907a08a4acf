//! Common test utilities.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use courier_core::provider::loopback::{LoopbackProvider, LoopbackSession};
use courier_core::{CourierConfig, CourierContext};

pub const PEER: &str = "5491122334455";
pub const PEER_CHAT: &str = "5491122334455@c.us";

pub struct TestCore {
    pub ctx: CourierContext,
    pub provider: Arc<LoopbackProvider>,
}

impl TestCore {
    /// Session the provider created most recently.
    pub fn session(&self) -> Arc<LoopbackSession> {
        self.provider.latest().expect("no session created yet")
    }

    pub async fn wait_ready(&self) -> u64 {
        self.ctx
            .sessions
            .wait_until_ready(Duration::from_secs(5))
            .await
            .expect("session never became ready")
            .generation
    }
}

pub fn config(identities: &[&str]) -> CourierConfig {
    CourierConfig {
        identities: identities.iter().map(|i| i.to_string()).collect(),
        ..CourierConfig::default()
    }
}

/// Build a core over a fresh loopback provider without starting a session.
pub fn build_core(config: CourierConfig) -> TestCore {
    let provider = Arc::new(LoopbackProvider::new());
    let ctx = CourierContext::builder()
        .config(config)
        .provider(provider.clone())
        .build()
        .expect("valid test config");
    TestCore { ctx, provider }
}

/// Build a core and bring its first session up.
pub async fn start_core(config: CourierConfig) -> TestCore {
    let core = build_core(config);
    core.ctx.start().await;
    core
}

/// Let spawned tasks (event pumps, background failovers) run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
