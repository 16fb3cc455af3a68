//! Remote file sources.
//!
//! A source abstracts the filesystem of one game server: connect, list the
//! files in a directory, read a file from a byte offset, disconnect. The
//! scheduler creates one source per server per tick through a
//! [`SourceFactory`] and never shares it between servers.
//!
//! # Available Sources
//!
//! - [`LocalDirSource`] - a directory tree on the local filesystem
//! - [`MemorySource`] - an in-memory tree with failure injection
//! - `SftpSource` - SSH/SFTP, behind the `sftp` feature
//!
//! # Errors
//!
//! Sources report rejected credentials as [`Error::Auth`](crate::Error::Auth)
//! and everything else transport related as a network error. The scheduler
//! retries on the next tick either way; an auth failure only changes the
//! message the operator sees.

mod local;
mod memory;
#[cfg(feature = "sftp")]
mod sftp;

pub use local::{LocalDirFactory, LocalDirSource};
pub use memory::{FailPoint, MemoryFs, MemorySource};
#[cfg(feature = "sftp")]
pub use sftp::{SftpFactory, SftpSource};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use killfeed_core::ServerTarget;
use regex::Regex;

use crate::Result;

/// Default maximum bytes returned by a single `read`.
pub const DEFAULT_READ_CHUNK: usize = 1024 * 1024;

/// A file as reported by a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Bare file name, no directory.
    pub name: String,
    /// Size in bytes at listing time.
    pub size: u64,
    /// Modification time, if the backend reports one.
    pub modified: Option<DateTime<Utc>>,
}

/// Bytes returned by a `read` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadChunk {
    pub bytes: Vec<u8>,
    /// The chunk reaches the end of the file as it was at read time.
    pub eof: bool,
}

/// Filesystem of one remote game server.
#[async_trait]
pub trait RemoteFileSource: Send {
    /// Human-readable backend name (used in logs).
    fn name(&self) -> &'static str;

    /// Open the connection and authenticate.
    async fn connect(&mut self) -> Result<()>;

    /// Files in `dir` whose bare name matches `pattern`, sorted by name
    /// ascending. Directories are never returned.
    async fn list(&mut self, dir: &str, pattern: &Regex) -> Result<Vec<RemoteFile>>;

    /// Read `path` starting at byte `offset`. Reading at or past the end
    /// returns an empty chunk with `eof` set.
    async fn read(&mut self, path: &str, offset: u64) -> Result<ReadChunk>;

    /// Close the connection. Safe to call when not connected.
    async fn disconnect(&mut self);
}

/// Builds a source for a server target.
pub trait SourceFactory: Send + Sync {
    fn create(&self, target: &ServerTarget) -> Result<Box<dyn RemoteFileSource>>;
}

/// Join a directory and a bare file name with `/`.
pub fn join_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Sort a listing by name and keep only names matching `pattern`.
pub(crate) fn filter_listing(mut files: Vec<RemoteFile>, pattern: &Regex) -> Vec<RemoteFile> {
    files.retain(|f| pattern.is_match(&f.name));
    files.sort_by(|a, b| a.name.cmp(&b.name));
    files
}
