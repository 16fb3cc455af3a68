//! Per-server tick summaries.

use std::time::Duration;

use chrono::{DateTime, Utc};
use killfeed_core::FileCursor;
use serde::Serialize;

use crate::error::{Error, ErrorKind};

/// Why a server's tick did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipCause {
    /// The previous tick for this server has not finished.
    AlreadyRunning,
    /// Shutdown was requested before the tick started.
    ShuttingDown,
}

impl SkipCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyRunning => "already_running",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// How a server's tick ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TickOutcome {
    Completed,
    Skipped { reason: SkipCause },
    Failed { kind: ErrorKind, message: String },
}

impl TickOutcome {
    pub fn failed(error: &Error) -> Self {
        Self::Failed {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Summary of one server's tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub server_id: String,
    pub outcome: TickOutcome,
    /// Files fully drained.
    pub files: usize,
    /// Bytes read from the remote.
    pub bytes: u64,
    /// Records that changed statistics.
    pub applied: u64,
    /// Records suppressed as already seen or already applied.
    pub duplicates: u64,
    /// Records skipped for a missing participant id.
    pub data_quality: u64,
    /// Unrecognized log lines passed through without effect.
    pub passthrough: u64,
    /// Malformed lines skipped by the parser.
    pub parse_errors: u64,
    /// Records kept with a fallback timestamp.
    pub flagged: u64,
    /// Cursor stored at the end of the tick, `None` unless completed.
    pub cursor: Option<FileCursor>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl TickReport {
    pub(crate) fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            outcome: TickOutcome::Completed,
            files: 0,
            bytes: 0,
            applied: 0,
            duplicates: 0,
            data_quality: 0,
            passthrough: 0,
            parse_errors: 0,
            flagged: 0,
            cursor: None,
            started_at: Utc::now(),
            duration: Duration::ZERO,
        }
    }

    pub(crate) fn skipped(server_id: impl Into<String>, reason: SkipCause) -> Self {
        Self {
            outcome: TickOutcome::Skipped { reason },
            ..Self::new(server_id)
        }
    }

    /// Parse errors and data-quality skips, plus one for a failed tick.
    pub fn errors(&self) -> u64 {
        let failed = matches!(self.outcome, TickOutcome::Failed { .. });
        self.parse_errors + self.data_quality + u64::from(failed)
    }

    /// One-line rendering, e.g. `2 files, 17 events, 0 errors`.
    pub fn summary(&self) -> String {
        format!(
            "{} files, {} events, {} errors",
            self.files,
            self.applied,
            self.errors()
        )
    }
}
