//! Shared state for the HTTP server.
//!
//! Wraps the CourierContext plus the settings handlers and middleware need.

use std::sync::Arc;

use courier_core::provider::bridge::BridgeProvider;
use courier_core::CourierContext;

use crate::HttpConfig;

/// Shared state available to all HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    /// The core every route forwards to.
    pub context: CourierContext,
    /// Bearer token required on protected routes, if any.
    pub auth_token: Option<String>,
    /// Set when sessions are backed by a sidecar that pushes events here.
    pub bridge: Option<Arc<BridgeProvider>>,
    pub max_upload_bytes: usize,
}

impl HttpState {
    pub fn new(context: CourierContext, config: &HttpConfig) -> Self {
        Self {
            context,
            auth_token: config.auth_token.clone().filter(|t| !t.is_empty()),
            bridge: None,
            max_upload_bytes: config.max_upload_bytes,
        }
    }

    pub fn with_bridge(mut self, bridge: Arc<BridgeProvider>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Whether `token` grants access. Always true when no token is configured.
    pub fn validate_token(&self, token: Option<&str>) -> bool {
        match &self.auth_token {
            None => true,
            Some(expected) => token == Some(expected.as_str()),
        }
    }
}
