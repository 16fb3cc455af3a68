//! In-memory deduplication of recently seen events.
//!
//! The [`DedupeCoordinator`] remembers the fingerprints of events seen during
//! the retention window, one partition per server. It is a fast filter in
//! front of the effects store: anything it lets through is still checked
//! against the durable fingerprint in the history tables, so losing the
//! registry on restart only costs a few redundant store lookups.
//!
//! # Partitions
//!
//! - The partition map is read-locked on the hot path and write-locked only
//!   the first time a server is seen.
//! - Each partition has its own mutex, so servers never contend.
//! - A partition keeps fingerprints ordered by event time for pruning and
//!   capacity eviction.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use killfeed_core::{EventFingerprint, RawRecord};
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

/// Default retention window.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Default maximum fingerprints kept per server.
pub const DEFAULT_MAX_PER_SERVER: usize = 100_000;

/// Dedup registry configuration.
#[derive(Debug, Clone)]
pub struct DedupeConfig {
    /// How far behind the newest event a fingerprint is kept.
    pub retention: Duration,
    /// Per-server cap; the oldest fingerprints are evicted beyond it.
    pub max_per_server: usize,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            max_per_server: DEFAULT_MAX_PER_SERVER,
        }
    }
}

#[derive(Default)]
struct Partition {
    seen: HashMap<EventFingerprint, DateTime<Utc>>,
    by_time: BTreeSet<(DateTime<Utc>, EventFingerprint)>,
    watermark: Option<DateTime<Utc>>,
}

impl Partition {
    fn insert(&mut self, fingerprint: EventFingerprint, at: DateTime<Utc>) {
        self.by_time.insert((at, fingerprint.clone()));
        self.seen.insert(fingerprint, at);
    }

    fn remove(&mut self, fingerprint: &EventFingerprint) -> bool {
        match self.seen.remove(fingerprint) {
            Some(at) => {
                self.by_time.remove(&(at, fingerprint.clone()));
                true
            }
            None => false,
        }
    }

    fn pop_oldest(&mut self) -> bool {
        match self.by_time.pop_first() {
            Some((_, fingerprint)) => {
                self.seen.remove(&fingerprint);
                true
            }
            None => false,
        }
    }

    /// Drop every fingerprint older than `cutoff`.
    fn prune_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while let Some((at, _)) = self.by_time.first() {
            if *at >= cutoff {
                break;
            }
            self.pop_oldest();
            removed += 1;
        }
        removed
    }
}

/// Process-wide registry of recently seen event fingerprints.
///
/// Thread-safe: share it across tasks via `Arc<DedupeCoordinator>`.
pub struct DedupeCoordinator {
    config: DedupeConfig,
    partitions: RwLock<HashMap<String, Arc<Mutex<Partition>>>>,
    entries: AtomicUsize,
    lookups: AtomicU64,
    hits: AtomicU64,
    evictions: AtomicU64,
}

impl DedupeCoordinator {
    pub fn new(config: DedupeConfig) -> Self {
        Self {
            config,
            partitions: RwLock::new(HashMap::new()),
            entries: AtomicUsize::new(0),
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &DedupeConfig {
        &self.config
    }

    fn partition(&self, server_id: &str) -> Arc<Mutex<Partition>> {
        if let Some(partition) = self.partitions.read().get(server_id) {
            return Arc::clone(partition);
        }
        let mut partitions = self.partitions.write();
        Arc::clone(partitions.entry(server_id.to_string()).or_default())
    }

    /// Check if a record is new, and mark it as seen if so.
    ///
    /// Returns `true` the first time a fingerprint is offered inside the
    /// retention window and `false` for every repeat.
    pub fn is_new(&self, record: &RawRecord) -> bool {
        let fingerprint = record.fingerprint();
        self.lookups.fetch_add(1, Ordering::Relaxed);
        counter!("dedupe_lookups_total").increment(1);

        let partition = self.partition(&record.server_id);
        let mut partition = partition.lock();

        if partition.seen.contains_key(&fingerprint) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            counter!("dedupe_hits_total").increment(1);
            debug!("Duplicate {}", fingerprint);
            return false;
        }

        partition.insert(fingerprint, record.timestamp());
        let mut evicted = 0;
        while partition.seen.len() > self.config.max_per_server && partition.pop_oldest() {
            evicted += 1;
        }
        drop(partition);

        self.entries.fetch_add(1, Ordering::Relaxed);
        self.account_evictions(evicted);
        true
    }

    /// Remove a record's fingerprint, so a retry of the same record counts as
    /// new. Used when the record's effects failed to persist.
    pub fn forget(&self, record: &RawRecord) {
        let fingerprint = record.fingerprint();
        let partition = self.partition(&record.server_id);
        if partition.lock().remove(&fingerprint) {
            self.entries.fetch_sub(1, Ordering::Relaxed);
            self.publish_entries();
        }
    }

    /// Advance a server's watermark to `at` (never backwards) and prune
    /// fingerprints older than the watermark minus the retention window.
    ///
    /// Returns the number of fingerprints pruned.
    pub fn advance_watermark(&self, server_id: &str, at: DateTime<Utc>) -> usize {
        let partition = self.partition(server_id);
        let mut partition = partition.lock();

        let watermark = match partition.watermark {
            Some(current) if current >= at => current,
            _ => at,
        };
        partition.watermark = Some(watermark);

        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = watermark.checked_sub_signed(retention) else {
            return 0;
        };
        let pruned = partition.prune_before(cutoff);
        drop(partition);

        if pruned > 0 {
            debug!("Pruned {} fingerprints for {}", pruned, server_id);
        }
        self.account_evictions(pruned);
        pruned
    }

    /// Current watermark of a server, if any record was seen.
    pub fn watermark(&self, server_id: &str) -> Option<DateTime<Utc>> {
        self.partitions
            .read()
            .get(server_id)
            .and_then(|p| p.lock().watermark)
    }

    fn account_evictions(&self, evicted: usize) {
        if evicted > 0 {
            self.entries.fetch_sub(evicted, Ordering::Relaxed);
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            counter!("dedupe_evictions_total").increment(evicted as u64);
        }
        self.publish_entries();
    }

    fn publish_entries(&self) {
        gauge!("dedupe_entries").set(self.entries.load(Ordering::Relaxed) as f64);
    }

    pub fn stats(&self) -> DedupeStats {
        DedupeStats {
            partitions: self.partitions.read().len(),
            fingerprints: self.entries.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for DedupeCoordinator {
    fn default() -> Self {
        Self::new(DedupeConfig::default())
    }
}

/// Statistics about the dedup registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupeStats {
    /// Servers with a partition.
    pub partitions: usize,
    /// Fingerprints currently retained.
    pub fingerprints: usize,
    pub lookups: u64,
    pub hits: u64,
    /// Fingerprints dropped by pruning or the capacity cap.
    pub evictions: u64,
}
