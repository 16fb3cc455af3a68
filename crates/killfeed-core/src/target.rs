//! Remote game-server targets.

use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default SSH/SFTP port.
pub const DEFAULT_PORT: u16 = 22;

/// Default file-name pattern: kill-feed CSVs named by their start time,
/// e.g. `2024.01.01-00.00.00.csv`.
pub const DEFAULT_FILE_PATTERN: &str = r"^\d{4}\.\d{2}\.\d{2}-\d{2}\.\d{2}\.\d{2}\.csv$";

/// One remote game server to ingest from.
///
/// Owned by the configuration layer; the pipeline treats it as read-only
/// input for the duration of a tick.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTarget {
    /// Unique server id.
    pub id: String,
    /// Hostname. A `host:port` form is accepted and overrides `port`.
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Remote directory holding the files. Empty selects the game's default
    /// layout, `/<host>_<id>/actual1/deathlogs`.
    #[serde(default)]
    pub base_path: String,
    /// Regex matched against bare file names.
    #[serde(default = "default_file_pattern")]
    pub file_pattern: String,
    /// Polling interval override in seconds.
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_file_pattern() -> String {
    DEFAULT_FILE_PATTERN.to_string()
}

impl ServerTarget {
    /// Minimal target with default port, layout and pattern.
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port: DEFAULT_PORT,
            username: String::new(),
            password: String::new(),
            base_path: String::new(),
            file_pattern: default_file_pattern(),
            poll_interval_secs: None,
        }
    }

    /// Hostname and port, honoring a `host:port` form in `host`.
    pub fn address(&self) -> (String, u16) {
        if let Some((host, port)) = self.host.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
        (self.host.clone(), self.port)
    }

    /// `user@host:port`, for logs and operator-facing messages.
    pub fn endpoint(&self) -> String {
        let (host, port) = self.address();
        if self.username.is_empty() {
            format!("{}:{}", host, port)
        } else {
            format!("{}@{}:{}", self.username, host, port)
        }
    }

    /// Directory to list on the remote side.
    pub fn remote_dir(&self) -> String {
        if !self.base_path.is_empty() {
            return self.base_path.clone();
        }
        let (host, _) = self.address();
        format!("/{}_{}/actual1/deathlogs", host, self.id)
    }

    /// Compile the file-name pattern.
    pub fn compile_pattern(&self) -> Result<Regex> {
        Regex::new(&self.file_pattern).map_err(|e| Error::InvalidPattern {
            pattern: self.file_pattern.clone(),
            reason: e.to_string(),
        })
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_secs.map(Duration::from_secs)
    }
}

impl fmt::Debug for ServerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTarget")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("base_path", &self.base_path)
            .field("file_pattern", &self.file_pattern)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .finish()
    }
}
