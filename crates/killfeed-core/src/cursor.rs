//! Per-server ingestion progress.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable bookmark of how far a server's files have been ingested.
///
/// Positions are ordered by file name first (names encode a sortable
/// timestamp) and byte offset second. The zero cursor (empty file name) sorts
/// before every real position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCursor {
    /// Name of the last file processed, empty if nothing was processed yet.
    pub file_name: String,
    /// Modification time of that file when it was processed.
    pub file_modified: Option<DateTime<Utc>>,
    /// Bytes of `file_name` fully consumed.
    pub byte_offset: u64,
    /// Lines of `file_name` fully consumed.
    pub line: u64,
}

impl FileCursor {
    /// Cursor positioned at the start of `file_name`.
    pub fn start_of(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Default::default()
        }
    }

    pub fn is_zero(&self) -> bool {
        self.file_name.is_empty()
    }

    /// Compare stream positions, ignoring modification time.
    pub fn position_cmp(&self, other: &Self) -> Ordering {
        self.file_name
            .cmp(&other.file_name)
            .then(self.byte_offset.cmp(&other.byte_offset))
    }

    /// Whether `self` is strictly behind `other`.
    pub fn is_behind(&self, other: &Self) -> bool {
        self.position_cmp(other) == Ordering::Less
    }

    /// Starting offset and line for `file_name` given this cursor: resume
    /// inside the cursor's own file, start from zero for any later file.
    pub fn resume_point(&self, file_name: &str) -> (u64, u64) {
        if self.file_name == file_name {
            (self.byte_offset, self.line)
        } else {
            (0, 0)
        }
    }
}
