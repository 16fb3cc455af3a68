//! Kill-feed ingestion pipeline components.
//!
//! This crate polls game servers for kill-feed files and turns new lines into
//! player statistics, rivalries and kill history.
//!
//! # Modules
//!
//! - [`source`] - Remote file sources (local directory, in-memory, SFTP)
//! - [`store`] - SQLite persistence for cursors and statistics
//! - [`dedupe`] - In-memory fingerprint registry
//! - [`effects`] - Applying records to statistics
//! - [`scheduler`] - Periodic multi-server driver
//! - [`config`] - Environment tuning and server targets
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │    Scheduler     │  ticks every resolution, bounded fan-out per server
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │ RemoteFileSource │  list + read from the cursor onward
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │      Parser      │  killfeed-core, CSV or server log lines
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │DedupeCoordinator │  drops fingerprints seen within the retention window
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │ EffectsPipeline  │  SQLite - one transaction per record
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │   OffsetStore    │  cursor committed after the batch
//! └──────────────────┘
//! ```
//!
//! The cursor only moves after effects are stored, and the effects store
//! applies each fingerprint once, so a tick that dies anywhere can simply be
//! redone.

pub mod config;
pub mod dedupe;
pub mod effects;
mod error;
pub mod scheduler;
pub mod source;
pub mod store;

// Re-export commonly used types at crate root
pub use error::{Error, ErrorKind, Result};

pub use config::{IngestConfig, JsonTargetsFile, StaticTargets, TargetProvider};
pub use dedupe::{DedupeConfig, DedupeCoordinator, DedupeStats};
pub use effects::{ApplyOutcome, EffectsPipeline, KillNotification, SkipReason};
pub use scheduler::{
    Scheduler, SchedulerConfig, ServerPhase, SkipCause, Start, TickOutcome, TickReport,
};
pub use source::{
    LocalDirFactory, LocalDirSource, MemoryFs, ReadChunk, RemoteFile, RemoteFileSource,
    SourceFactory,
};
pub use store::{Database, OffsetStore, SqliteOffsetStore, StatsStore};
