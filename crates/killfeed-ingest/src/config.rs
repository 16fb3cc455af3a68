//! Process configuration and server targets.
//!
//! Scheduler tuning comes from `KILLFEED_*` environment variables with
//! defaults; server targets come from a [`TargetProvider`] that the scheduler
//! asks again at every tick, so edits to the servers file apply without a
//! restart.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use killfeed_core::ServerTarget;
use serde::Deserialize;

use crate::dedupe::DedupeConfig;
use crate::scheduler::SchedulerConfig;
use crate::{Error, Result};

/// Tuning loaded from the environment.
#[derive(Debug, Clone, Default)]
pub struct IngestConfig {
    pub scheduler: SchedulerConfig,
    pub dedupe: DedupeConfig,
}

impl IngestConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional:
    /// - `KILLFEED_RESOLUTION_SECS`: driver wake-up period (default: 30)
    /// - `KILLFEED_POLL_INTERVAL_SECS`: per-server polling interval (default: 300)
    /// - `KILLFEED_MAX_CONCURRENT_SERVERS`: servers processed at once
    ///   (default: CPU count, at most 8)
    /// - `KILLFEED_REMOTE_TIMEOUT_SECS`: deadline for connect, list and each read
    ///   (default: 30)
    /// - `KILLFEED_DEDUPE_RETENTION_SECS`: dedup window (default: 3600)
    /// - `KILLFEED_DEDUPE_MAX_PER_SERVER`: dedup capacity per server (default: 100000)
    pub fn from_env() -> Result<Self> {
        let defaults = SchedulerConfig::default();
        let dedupe_defaults = DedupeConfig::default();

        let scheduler = SchedulerConfig {
            resolution: env_secs("KILLFEED_RESOLUTION_SECS", defaults.resolution)?,
            default_interval: env_secs("KILLFEED_POLL_INTERVAL_SECS", defaults.default_interval)?,
            max_concurrent_servers: env_parse(
                "KILLFEED_MAX_CONCURRENT_SERVERS",
                defaults.max_concurrent_servers,
            )?
            .max(1),
            remote_timeout: env_secs("KILLFEED_REMOTE_TIMEOUT_SECS", defaults.remote_timeout)?,
        };
        let dedupe = DedupeConfig {
            retention: env_secs("KILLFEED_DEDUPE_RETENTION_SECS", dedupe_defaults.retention)?,
            max_per_server: env_parse(
                "KILLFEED_DEDUPE_MAX_PER_SERVER",
                dedupe_defaults.max_per_server,
            )?
            .max(1),
        };

        tracing::info!(
            resolution_secs = scheduler.resolution.as_secs(),
            poll_interval_secs = scheduler.default_interval.as_secs(),
            max_concurrent_servers = scheduler.max_concurrent_servers,
            remote_timeout_secs = scheduler.remote_timeout.as_secs(),
            dedupe_retention_secs = dedupe.retention.as_secs(),
            "ingest configuration loaded"
        );

        Ok(Self { scheduler, dedupe })
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{}={:?}: {}", key, raw, e))),
        _ => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    let secs = env_parse(key, default.as_secs())?;
    if secs == 0 {
        return Err(Error::Config(format!("{} must be at least 1", key)));
    }
    Ok(Duration::from_secs(secs))
}

/// Supplies the current set of servers.
pub trait TargetProvider: Send + Sync {
    fn targets(&self) -> Result<Vec<ServerTarget>>;
}

/// Fixed list of targets.
#[derive(Debug, Clone, Default)]
pub struct StaticTargets(Vec<ServerTarget>);

impl StaticTargets {
    pub fn new(targets: Vec<ServerTarget>) -> Result<Self> {
        validate(&targets)?;
        Ok(Self(targets))
    }
}

impl TargetProvider for StaticTargets {
    fn targets(&self) -> Result<Vec<ServerTarget>> {
        Ok(self.0.clone())
    }
}

/// Targets read from a JSON file on every call.
///
/// The file holds either an array of targets or `{"servers": [...]}`.
#[derive(Debug, Clone)]
pub struct JsonTargetsFile {
    path: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TargetsDocument {
    List(Vec<ServerTarget>),
    Wrapped { servers: Vec<ServerTarget> },
}

impl JsonTargetsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TargetProvider for JsonTargetsFile {
    fn targets(&self) -> Result<Vec<ServerTarget>> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let targets = match serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", self.path.display(), e)))?
        {
            TargetsDocument::List(targets) => targets,
            TargetsDocument::Wrapped { servers } => servers,
        };
        validate(&targets)?;
        Ok(targets)
    }
}

fn validate(targets: &[ServerTarget]) -> Result<()> {
    let mut seen = HashSet::new();
    for target in targets {
        if target.id.trim().is_empty() {
            return Err(Error::Config(format!(
                "server with host '{}' has an empty id",
                target.host
            )));
        }
        if !seen.insert(target.id.as_str()) {
            return Err(Error::Config(format!("duplicate server id '{}'", target.id)));
        }
    }
    Ok(())
}
