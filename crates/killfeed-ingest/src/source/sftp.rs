//! SSH/SFTP source.
//!
//! `ssh2` is blocking, so every call runs on the blocking pool with the
//! session behind a mutex. The session's own timeout bounds each libssh2
//! call; the scheduler adds its deadline on top.

use std::io::{Read, Seek, SeekFrom};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use killfeed_core::ServerTarget;
use parking_lot::Mutex;
use regex::Regex;
use ssh2::{Session, Sftp};

use super::{
    DEFAULT_READ_CHUNK, ReadChunk, RemoteFile, RemoteFileSource, SourceFactory, filter_listing,
};
use crate::{Error, Result};

struct Connection {
    session: Session,
    sftp: Sftp,
}

/// SFTP connection to one game server.
pub struct SftpSource {
    target: ServerTarget,
    timeout: Duration,
    chunk_size: usize,
    conn: Option<Arc<Mutex<Connection>>>,
}

impl SftpSource {
    pub fn new(target: ServerTarget, timeout: Duration) -> Self {
        Self {
            target,
            timeout,
            chunk_size: DEFAULT_READ_CHUNK,
            conn: None,
        }
    }

    fn connection(&self) -> Result<Arc<Mutex<Connection>>> {
        self.conn
            .clone()
            .ok_or_else(|| Error::Network("source is not connected".to_string()))
    }
}

fn network(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Network(format!("{}: {}", context, e))
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Network(format!("blocking task failed: {}", e)))?
}

fn open(target: &ServerTarget, timeout: Duration) -> Result<Connection> {
    let (host, port) = target.address();
    let endpoint = target.endpoint();
    let addr = (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|e| network("resolve", e))?
        .next()
        .ok_or_else(|| Error::Network(format!("{} did not resolve", host)))?;

    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| network("connect", e))?;
    let mut session = Session::new().map_err(|e| network("session", e))?;
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| network("handshake", e))?;

    session
        .userauth_password(&target.username, &target.password)
        .map_err(|e| Error::Auth {
            endpoint: endpoint.clone(),
            reason: e.message().to_string(),
        })?;
    if !session.authenticated() {
        return Err(Error::Auth {
            endpoint,
            reason: "server did not accept the credentials".to_string(),
        });
    }

    let sftp = session.sftp().map_err(|e| network("sftp subsystem", e))?;
    Ok(Connection { session, sftp })
}

#[async_trait]
impl RemoteFileSource for SftpSource {
    fn name(&self) -> &'static str {
        "sftp"
    }

    async fn connect(&mut self) -> Result<()> {
        let target = self.target.clone();
        let timeout = self.timeout;
        let conn = blocking(move || open(&target, timeout)).await?;
        self.conn = Some(Arc::new(Mutex::new(conn)));
        Ok(())
    }

    async fn list(&mut self, dir: &str, pattern: &Regex) -> Result<Vec<RemoteFile>> {
        let conn = self.connection()?;
        let dir = dir.to_string();
        let files = blocking(move || {
            let conn = conn.lock();
            let entries = conn
                .sftp
                .readdir(Path::new(&dir))
                .map_err(|e| network("readdir", e))?;
            Ok(entries
                .into_iter()
                .filter(|(_, stat)| stat.is_file())
                .filter_map(|(path, stat)| {
                    let name = path.file_name()?.to_str()?.to_string();
                    Some(RemoteFile {
                        name,
                        size: stat.size.unwrap_or(0),
                        modified: stat
                            .mtime
                            .and_then(|t| Utc.timestamp_opt(t as i64, 0).single()),
                    })
                })
                .collect::<Vec<_>>())
        })
        .await?;
        Ok(filter_listing(files, pattern))
    }

    async fn read(&mut self, path: &str, offset: u64) -> Result<ReadChunk> {
        let conn = self.connection()?;
        let path = path.to_string();
        let chunk_size = self.chunk_size;
        blocking(move || {
            let conn = conn.lock();
            let mut file = conn
                .sftp
                .open(Path::new(&path))
                .map_err(|e| network("open", e))?;
            let len = file
                .stat()
                .map_err(|e| network("stat", e))?
                .size
                .unwrap_or(0);
            if offset >= len {
                return Ok(ReadChunk {
                    bytes: Vec::new(),
                    eof: true,
                });
            }

            file.seek(SeekFrom::Start(offset))
                .map_err(|e| network("seek", e))?;
            let mut bytes = Vec::new();
            file.take(chunk_size as u64)
                .read_to_end(&mut bytes)
                .map_err(|e| network("read", e))?;
            let eof = offset + bytes.len() as u64 >= len;
            Ok(ReadChunk { bytes, eof })
        })
        .await
    }

    async fn disconnect(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let _ = blocking(move || {
            let conn = conn.lock();
            conn.session
                .disconnect(None, "closing", None)
                .map_err(|e| network("disconnect", e))
        })
        .await;
    }
}

/// Creates an [`SftpSource`] per target.
#[derive(Debug, Clone)]
pub struct SftpFactory {
    timeout: Duration,
}

impl SftpFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl SourceFactory for SftpFactory {
    fn create(&self, target: &ServerTarget) -> Result<Box<dyn RemoteFileSource>> {
        Ok(Box::new(SftpSource::new(target.clone(), self.timeout)))
    }
}
