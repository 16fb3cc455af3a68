//! Core types and parsing for the kill-feed ingestion pipeline.
//!
//! This crate provides:
//! - Typed records for kills, suicides, connections and world events
//! - Parsing of kill-feed CSVs and server logs into those records
//! - Event fingerprints for deduplication
//! - Per-server targets and file cursors
//! - Prometheus metrics helpers
//! - Shared error types
//!
//! Nothing here performs I/O on game servers; see `killfeed-ingest` for that.

mod error;
pub mod cursor;
pub mod fingerprint;
pub mod metrics;
pub mod parser;
pub mod record;
pub mod target;

pub use cursor::FileCursor;
pub use error::{Error, Result};
pub use fingerprint::{EventFingerprint, FingerprintTime};
pub use parser::{ChunkContext, LogFormat, ParseOutput, parse, parse_chunk, parse_timestamp};
pub use record::{
    ConnectionAction, ConnectionEvent, EventTime, KillEvent, Player, RawRecord, RecordEvent,
    RecordKind, SourcePosition, SuicideCause, SuicideEvent, WorldEvent, WorldEventKind,
};
pub use target::ServerTarget;
