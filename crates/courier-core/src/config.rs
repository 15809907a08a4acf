//! Runtime configuration for the core.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CourierError;
use crate::provider::SessionIdentity;

/// Which job failures, besides disconnects, replace the active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverPolicy {
    /// Only provider faults (a send or initialize that threw).
    #[default]
    ProviderFaults,
    /// Provider faults and timeouts (job budget or readiness gate).
    AnyFailure,
}

impl FailoverPolicy {
    pub fn triggers_on(self, err: &CourierError) -> bool {
        match self {
            FailoverPolicy::ProviderFaults => err.is_session_fault(),
            FailoverPolicy::AnyFailure => err.is_session_fault() || err.is_timeout(),
        }
    }
}

/// Core configuration. Every field has a default so partial JSON files work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// Ordered identity pool; failover rotates through it.
    pub identities: Vec<String>,
    /// Budget for one queued job, readiness gate included.
    pub job_timeout_secs: u64,
    /// How long a job waits for a ready session. Capped by
    /// `job_timeout_secs`, so it only has its own effect when smaller.
    pub ready_timeout_secs: u64,
    pub reply_wait_secs: u64,
    /// Delay before replacing a session whose `initialize` failed.
    pub failover_backoff_secs: u64,
    pub failover_policy: FailoverPolicy,
    pub log_dir: Option<PathBuf>,
    pub default_country_code: Option<String>,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            identities: vec!["primary".to_string()],
            job_timeout_secs: 60,
            ready_timeout_secs: 60,
            reply_wait_secs: 300,
            failover_backoff_secs: 5,
            failover_policy: FailoverPolicy::default(),
            log_dir: None,
            default_country_code: None,
        }
    }
}

impl CourierConfig {
    pub fn validate(&self) -> Result<(), CourierError> {
        if self.identities.is_empty() {
            return Err(CourierError::Validation(
                "at least one session identity is required".to_string(),
            ));
        }
        if self.identities.iter().any(|i| i.trim().is_empty()) {
            return Err(CourierError::Validation(
                "session identities cannot be blank".to_string(),
            ));
        }
        if self.job_timeout_secs == 0 || self.ready_timeout_secs == 0 || self.reply_wait_secs == 0
        {
            return Err(CourierError::Validation(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.ready_timeout_secs >= self.job_timeout_secs {
            log::warn!(
                "ready_timeout_secs ({}) is not below job_timeout_secs ({}); \
                 jobs waiting for a session will hit the job budget first",
                self.ready_timeout_secs,
                self.job_timeout_secs
            );
        }
        Ok(())
    }

    pub fn identity_pool(&self) -> Vec<SessionIdentity> {
        self.identities
            .iter()
            .map(|i| SessionIdentity::new(i.trim()))
            .collect()
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Readiness-gate wait actually applied inside a job.
    pub fn gate_timeout(&self) -> Duration {
        self.ready_timeout().min(self.job_timeout())
    }

    pub fn reply_wait(&self) -> Duration {
        Duration::from_secs(self.reply_wait_secs)
    }

    pub fn failover_backoff(&self) -> Duration {
        Duration::from_secs(self.failover_backoff_secs)
    }
}
