//! Append-only JSONL session log.
//!
//! Each session writes one file; each line is a timestamped entry with a
//! tagged event payload. The log is the audit trail for everything the core
//! decided: observations, actions, safety trips, dialog handling, recovery.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::warn;

use crate::errors::CoreError;
use crate::ports::Action;
use crate::state::Counters;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum LogEvent {
    SessionStarted {
        session_id: String,
        profile: String,
        safety_level: String,
    },
    SessionEnded {
        profile: String,
        duration_secs: f64,
        reason: String,
        counters: Counters,
    },
    Observation {
        cycle: u64,
        enemies: usize,
        items: usize,
    },
    ActionExecuted {
        action: Action,
        success: bool,
        error: Option<String>,
    },
    CycleError {
        cycle: u64,
        step: String,
        detail: String,
    },
    SafetyTriggered {
        kind: String,
        detail: String,
    },
    DialogDetected {
        title: String,
        classification: String,
        expected: bool,
    },
    DialogResolved {
        title: String,
        response: String,
        via_fallback: bool,
    },
    RecoveryStarted {
        reason: String,
    },
    RecoveryCompleted {
        window_active: bool,
        automation_resumed: bool,
    },
}

#[derive(Debug, Serialize)]
struct LogLine<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a LogEvent,
}

#[derive(Debug)]
pub struct SessionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl SessionLog {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &LogEvent) -> Result<(), CoreError> {
        let line = serde_json::to_string(&LogLine {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event,
        })
        .map_err(|e| CoreError::Io(std::io::Error::other(e)))?;
        let mut writer = self.writer.lock().unwrap();
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }

    /// Fire-and-forget variant for monitor threads, where a logging failure
    /// must not take down the loop.
    pub fn record(&self, event: LogEvent) {
        if let Err(e) = self.append(&event) {
            warn!(error = %e, path = %self.path.display(), "failed to write log entry");
        }
    }
}
