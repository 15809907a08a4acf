//! Append-only message audit log.
//!
//! One line per outbound send and inbound message, written to
//! `{log_dir}/courier.log`. Writing is best-effort: an audit failure never
//! fails the operation being audited.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use chrono::{SecondsFormat, Utc};

use crate::sync::lock;

const AUDIT_FILE: &str = "courier.log";

/// Direction of an audited message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    fn tag(self) -> &'static str {
        match self {
            Direction::Outbound => "OUT",
            Direction::Inbound => "IN",
        }
    }
}

/// Cheaply clonable handle to the audit file. Disabled when no directory
/// was configured or the file could not be opened.
#[derive(Clone, Default)]
pub struct AuditLog {
    file: Arc<Mutex<Option<File>>>,
}

impl AuditLog {
    /// An audit log that drops everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Open (or create) `{log_dir}/courier.log`.
    pub fn open(log_dir: Option<&Path>) -> Self {
        let file = log_dir.and_then(|dir| {
            if let Err(e) = std::fs::create_dir_all(dir) {
                log::warn!("Cannot create audit log dir {}: {}", dir.display(), e);
                return None;
            }
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(AUDIT_FILE))
                .map_err(|e| log::warn!("Cannot open audit log in {}: {}", dir.display(), e))
                .ok()
        });
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.file).is_some()
    }

    /// Append `[timestamp] DIR conversation: text`. Newlines in `text` are
    /// escaped so each record stays on one line.
    pub fn record(&self, direction: Direction, conversation: &str, text: &str) {
        let mut guard = lock(&self.file);
        if let Some(file) = guard.as_mut() {
            let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            let text = text.replace('\n', "\\n");
            let _ = writeln!(file, "[{}] {} {}: {}", ts, direction.tag(), conversation, text);
            let _ = file.flush();
        }
    }
}
