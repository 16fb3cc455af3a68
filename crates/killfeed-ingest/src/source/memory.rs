//! In-memory source with failure injection.
//!
//! [`MemoryFs`] is a shared file tree: tests append to files between ticks
//! the way a game server does, and queue failures for the next operation.
//! It doubles as the [`SourceFactory`] for every target.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use killfeed_core::ServerTarget;
use parking_lot::Mutex;
use regex::Regex;

use super::{
    DEFAULT_READ_CHUNK, ReadChunk, RemoteFile, RemoteFileSource, SourceFactory, filter_listing,
};
use crate::{Error, Result};

/// Operation a queued failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// Next `connect` is rejected as bad credentials.
    Auth,
    /// Next `connect` fails with a network error.
    Connect,
    /// Next `list` fails with a network error.
    List,
    /// Next `read` fails with a network error.
    Read,
}

#[derive(Debug, Clone)]
struct MemFile {
    bytes: Vec<u8>,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    files: BTreeMap<String, MemFile>,
    failures: VecDeque<FailPoint>,
    latency: Option<Duration>,
    connects: usize,
    disconnects: usize,
    reads: usize,
}

/// Shared in-memory file tree.
#[derive(Debug, Clone, Default)]
pub struct MemoryFs {
    inner: Arc<Mutex<Inner>>,
    chunk_size: Option<usize>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the bytes returned by one `read` for sources created from here.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size.max(1));
        self
    }

    /// Create or replace a file, stamped with the current time.
    pub fn put(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        self.put_at(path, bytes, Utc::now());
    }

    /// Create or replace a file with an explicit modification time.
    pub fn put_at(&self, path: &str, bytes: impl Into<Vec<u8>>, modified: DateTime<Utc>) {
        self.inner.lock().files.insert(
            path.to_string(),
            MemFile {
                bytes: bytes.into(),
                modified,
            },
        );
    }

    /// Append to a file, creating it if needed.
    pub fn append(&self, path: &str, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        let file = inner.files.entry(path.to_string()).or_insert_with(|| MemFile {
            bytes: Vec::new(),
            modified: Utc::now(),
        });
        file.bytes.extend_from_slice(bytes);
        file.modified = Utc::now();
    }

    /// Replace a file's content, keeping it in place (log truncation).
    pub fn truncate(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        self.put(path, bytes);
    }

    pub fn remove(&self, path: &str) {
        self.inner.lock().files.remove(path);
    }

    /// Queue a one-shot failure.
    pub fn fail_next(&self, point: FailPoint) {
        self.inner.lock().failures.push_back(point);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.lock().latency = latency;
    }

    pub fn connects(&self) -> usize {
        self.inner.lock().connects
    }

    pub fn disconnects(&self) -> usize {
        self.inner.lock().disconnects
    }

    pub fn reads(&self) -> usize {
        self.inner.lock().reads
    }

    fn take_failure(&self, points: &[FailPoint]) -> Option<FailPoint> {
        let mut inner = self.inner.lock();
        let idx = inner.failures.iter().position(|p| points.contains(p))?;
        inner.failures.remove(idx)
    }

    async fn delay(&self) {
        let latency = self.inner.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl SourceFactory for MemoryFs {
    fn create(&self, target: &ServerTarget) -> Result<Box<dyn RemoteFileSource>> {
        Ok(Box::new(MemorySource {
            fs: self.clone(),
            endpoint: target.endpoint(),
            chunk_size: self.chunk_size.unwrap_or(DEFAULT_READ_CHUNK),
            connected: false,
        }))
    }
}

/// Connection to a [`MemoryFs`].
#[derive(Debug)]
pub struct MemorySource {
    fs: MemoryFs,
    endpoint: String,
    chunk_size: usize,
    connected: bool,
}

impl MemorySource {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::Network("source is not connected".to_string()))
        }
    }
}

#[async_trait]
impl RemoteFileSource for MemorySource {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&mut self) -> Result<()> {
        self.fs.delay().await;
        self.fs.inner.lock().connects += 1;
        match self.fs.take_failure(&[FailPoint::Auth, FailPoint::Connect]) {
            Some(FailPoint::Auth) => Err(Error::Auth {
                endpoint: self.endpoint.clone(),
                reason: "password rejected".to_string(),
            }),
            Some(_) => Err(Error::Network(format!(
                "connection to {} refused",
                self.endpoint
            ))),
            None => {
                self.connected = true;
                Ok(())
            }
        }
    }

    async fn list(&mut self, dir: &str, pattern: &Regex) -> Result<Vec<RemoteFile>> {
        self.ensure_connected()?;
        self.fs.delay().await;
        if self.fs.take_failure(&[FailPoint::List]).is_some() {
            return Err(Error::Network(format!("listing {} failed", dir)));
        }

        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let files = self
            .fs
            .inner
            .lock()
            .files
            .iter()
            .filter_map(|(path, file)| {
                let name = path.strip_prefix(&prefix)?;
                (!name.contains('/')).then(|| RemoteFile {
                    name: name.to_string(),
                    size: file.bytes.len() as u64,
                    modified: Some(file.modified),
                })
            })
            .collect();

        Ok(filter_listing(files, pattern))
    }

    async fn read(&mut self, path: &str, offset: u64) -> Result<ReadChunk> {
        self.ensure_connected()?;
        self.fs.delay().await;
        if self.fs.take_failure(&[FailPoint::Read]).is_some() {
            return Err(Error::Network(format!("read of {} failed", path)));
        }

        let mut inner = self.fs.inner.lock();
        inner.reads += 1;
        let file = inner
            .files
            .get(path)
            .ok_or_else(|| Error::Network(format!("{} not found", path)))?;

        let len = file.bytes.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start.saturating_add(self.chunk_size).min(len);
        Ok(ReadChunk {
            bytes: file.bytes[start..end].to_vec(),
            eof: end == len,
        })
    }

    async fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            self.fs.inner.lock().disconnects += 1;
        }
    }
}
