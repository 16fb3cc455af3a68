//! Error types for record parsing.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while turning a raw line into a record.
///
/// These never abort a file: the parser logs them, counts them and moves on
/// to the next line.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A kill-feed CSV row had fewer columns than the oldest known layout.
    #[error("line {line}: expected at least {expected} fields, found {found}")]
    FieldCount {
        /// 1-based line number within the source file.
        line: u64,
        /// Minimum number of fields required.
        expected: usize,
        /// Number of fields actually present.
        found: usize,
    },

    /// A server-log line carried the frame prefix but a broken body.
    #[error("line {line}: malformed log line: {reason}")]
    MalformedLogLine {
        /// 1-based line number within the source file.
        line: u64,
        /// Description of what's wrong.
        reason: String,
    },

    /// A file-name pattern configured for a server is not a valid regex.
    #[error("invalid file pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The pattern as configured.
        pattern: String,
        /// Compiler message from the regex engine.
        reason: String,
    },
}

impl Error {
    /// Line number the error refers to, if it is a per-line error.
    pub fn line(&self) -> Option<u64> {
        match self {
            Self::FieldCount { line, .. }
            | Self::MalformedLogLine { line, .. } => Some(*line),
            Self::InvalidPattern { .. } => None,
        }
    }
}
