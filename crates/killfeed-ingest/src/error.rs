//! Error types for the ingestion pipeline.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
///
/// Every variant is caught at the per-server tick boundary; none of them stop
/// the process. [`Error::kind`] folds them into the coarse taxonomy used in
/// tick reports and metrics.
#[derive(Error, Debug)]
pub enum Error {
    /// The remote rejected our credentials. Retrying in the same tick won't
    /// help.
    #[error("authentication failed for {endpoint}: {reason} (check the server's username and password)")]
    Auth { endpoint: String, reason: String },

    /// Connect, list or read failed for a transport reason.
    #[error("network error: {0}")]
    Network(String),

    /// A remote operation exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The cursor could not be committed.
    #[error("failed to persist cursor for server {server_id}: {reason}")]
    Persist { server_id: String, reason: String },

    /// SQLite error.
    #[error("SQLite error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Record model error (bad file pattern and the like).
    #[error(transparent)]
    Core(#[from] killfeed_core::Error),

    /// No target with this id is configured.
    #[error("unknown server id '{0}'")]
    UnknownServer(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Coarse error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credentials rejected; terminal for the tick.
    Auth,
    /// Transient transport failure, including timeouts.
    Network,
    /// Cursor or effects could not be stored.
    Persist,
    /// Bad configuration for a server.
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Network => "network",
            Self::Persist => "persist",
            Self::Config => "config",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth { .. } => ErrorKind::Auth,
            Self::Network(_) | Self::Timeout { .. } | Self::Io(_) => ErrorKind::Network,
            Self::Persist { .. } | Self::Database(_) | Self::Serialization(_) => {
                ErrorKind::Persist
            }
            Self::Config(_) | Self::Core(_) | Self::UnknownServer(_) => ErrorKind::Config,
        }
    }

    /// Whether the next tick can be expected to succeed without operator
    /// action.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Persist)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
