//! Local directory source.
//!
//! Serves a server's files from a local tree, for mounted shares or copies
//! synced by an external tool. The remote directory of a target is resolved
//! under a root, so `/host_7020/actual1/deathlogs` becomes
//! `<root>/host_7020/actual1/deathlogs`.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use killfeed_core::ServerTarget;
use regex::Regex;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::{
    DEFAULT_READ_CHUNK, ReadChunk, RemoteFile, RemoteFileSource, SourceFactory, filter_listing,
};
use crate::{Error, Result};

/// Source backed by the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalDirSource {
    root: PathBuf,
    chunk_size: usize,
    connected: bool,
}

impl LocalDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_size: DEFAULT_READ_CHUNK,
            connected: false,
        }
    }

    /// Limit the bytes returned by one `read`.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn resolve(&self, remote: &str) -> PathBuf {
        self.root.join(remote.trim_start_matches('/'))
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::Network("source is not connected".to_string()))
        }
    }
}

#[async_trait]
impl RemoteFileSource for LocalDirSource {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn connect(&mut self) -> Result<()> {
        let meta = fs::metadata(&self.root).await.map_err(|e| {
            Error::Network(format!("root {} unavailable: {}", self.root.display(), e))
        })?;
        if !meta.is_dir() {
            return Err(Error::Network(format!(
                "root {} is not a directory",
                self.root.display()
            )));
        }
        self.connected = true;
        Ok(())
    }

    async fn list(&mut self, dir: &str, pattern: &Regex) -> Result<Vec<RemoteFile>> {
        self.ensure_connected()?;
        let path = self.resolve(dir);
        let mut entries = fs::read_dir(&path).await?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                tracing::debug!("Skipping non UTF-8 file name in {}", path.display());
                continue;
            };
            files.push(RemoteFile {
                name,
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        Ok(filter_listing(files, pattern))
    }

    async fn read(&mut self, path: &str, offset: u64) -> Result<ReadChunk> {
        self.ensure_connected()?;
        let local = self.resolve(path);
        read_range(&local, offset, self.chunk_size).await
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }
}

async fn read_range(path: &Path, offset: u64, chunk_size: usize) -> Result<ReadChunk> {
    let mut file = fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    if offset >= len {
        return Ok(ReadChunk {
            bytes: Vec::new(),
            eof: true,
        });
    }

    file.seek(SeekFrom::Start(offset)).await?;
    let mut bytes = Vec::with_capacity(chunk_size.min((len - offset) as usize));
    file.take(chunk_size as u64).read_to_end(&mut bytes).await?;
    let eof = offset + bytes.len() as u64 >= len;

    Ok(ReadChunk { bytes, eof })
}

/// Creates [`LocalDirSource`]s rooted at one directory.
#[derive(Debug, Clone)]
pub struct LocalDirFactory {
    root: PathBuf,
    chunk_size: usize,
}

impl LocalDirFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_size: DEFAULT_READ_CHUNK,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

impl SourceFactory for LocalDirFactory {
    fn create(&self, _target: &ServerTarget) -> Result<Box<dyn RemoteFileSource>> {
        Ok(Box::new(
            LocalDirSource::new(self.root.clone()).with_chunk_size(self.chunk_size),
        ))
    }
}
