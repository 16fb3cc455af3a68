//! Periodic ingestion driver.
//!
//! The scheduler wakes every `resolution`, asks the [`TargetProvider`] for the
//! current servers and runs a tick for every server whose polling interval
//! has elapsed, at most `max_concurrent_servers` at a time.
//!
//! A server's tick walks a fixed sequence of phases:
//!
//! ```text
//! Idle -> Connecting -> Listing -> Draining -> Committing -> Idle
//! ```
//!
//! Connect, list and every read carry a timeout. Any failure sends the server
//! back to idle with its durable cursor untouched, so the next tick redoes the
//! same bytes; the effects store applies each fingerprint at most once, which
//! makes the redo harmless. The source is disconnected on every exit path.
//!
//! # Usage
//!
//! ```ignore
//! let scheduler = Arc::new(Scheduler::new(config, targets, sources, offsets, dedupe, effects));
//! let mut reports = scheduler.subscribe();
//! tokio::spawn(Arc::clone(&scheduler).run_periodic());
//! ```

mod report;
mod slots;

pub use report::{SkipCause, TickOutcome, TickReport};
pub use slots::{ServerPhase, SlotArena, SlotGuard};

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use killfeed_core::metrics::{increment, increment_for_server};
use killfeed_core::{ChunkContext, FileCursor, RawRecord, ServerTarget, parse_chunk};
use metrics::{counter, gauge, histogram};
use regex::Regex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::TargetProvider;
use crate::dedupe::DedupeCoordinator;
use crate::effects::{ApplyOutcome, EffectsPipeline, SkipReason};
use crate::source::{RemoteFile, RemoteFileSource, SourceFactory, join_path};
use crate::store::OffsetStore;
use crate::{Error, Result};

/// Default driver wake-up period.
pub const DEFAULT_RESOLUTION: Duration = Duration::from_secs(30);

/// Default per-server polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default deadline for connect, list and each read.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound of the default fan-out.
const MAX_DEFAULT_CONCURRENCY: usize = 8;

/// Capacity of the report channel.
const REPORT_CAPACITY: usize = 256;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the driver wakes to look for due servers.
    pub resolution: Duration,
    /// Polling interval for servers without an override.
    pub default_interval: Duration,
    /// Servers processed at once.
    pub max_concurrent_servers: usize,
    /// Deadline for each remote operation.
    pub remote_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            resolution: DEFAULT_RESOLUTION,
            default_interval: DEFAULT_POLL_INTERVAL,
            max_concurrent_servers: num_cpus::get().clamp(1, MAX_DEFAULT_CONCURRENCY),
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }
}

/// Where a server's tick starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Start {
    /// Resume from the stored cursor.
    Cursor,
    /// Re-read every file modified within this window from its start. Files
    /// after the cursor are read as usual whatever their age.
    Lookback(Duration),
}

/// Clears the global tick flag when a tick ends.
struct TickFlag<'a>(&'a AtomicBool);

impl Drop for TickFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
        gauge!("scheduler_tick_running").set(0.0);
    }
}

/// Periodic multi-server ingestion driver.
pub struct Scheduler {
    config: SchedulerConfig,
    targets: Arc<dyn TargetProvider>,
    sources: Arc<dyn SourceFactory>,
    offsets: Arc<dyn OffsetStore>,
    dedupe: Arc<DedupeCoordinator>,
    effects: Arc<EffectsPipeline>,
    slots: Arc<SlotArena>,
    tick_running: AtomicBool,
    running: Arc<AtomicBool>,
    reports: broadcast::Sender<TickReport>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        targets: Arc<dyn TargetProvider>,
        sources: Arc<dyn SourceFactory>,
        offsets: Arc<dyn OffsetStore>,
        dedupe: Arc<DedupeCoordinator>,
        effects: Arc<EffectsPipeline>,
    ) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        Self {
            config,
            targets,
            sources,
            offsets,
            dedupe,
            effects,
            slots: SlotArena::new(),
            tick_running: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(true)),
            reports,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn slots(&self) -> &SlotArena {
        &self.slots
    }

    pub fn effects(&self) -> &Arc<EffectsPipeline> {
        &self.effects
    }

    pub fn dedupe(&self) -> &Arc<DedupeCoordinator> {
        &self.dedupe
    }

    /// Receive every tick report from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TickReport> {
        self.reports.subscribe()
    }

    /// Flag cleared to request shutdown; shareable with signal handlers.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal the scheduler to stop. Ticks in progress finish their current
    /// file and commit.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_tick_running(&self) -> bool {
        self.tick_running.load(Ordering::SeqCst)
    }

    /// Run one global tick: every due server, bounded fan-out.
    ///
    /// Returns an empty list without doing anything if the previous tick is
    /// still running.
    pub async fn run_tick(&self) -> Result<Vec<TickReport>> {
        if self
            .tick_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Previous tick still running, skipping this one");
            increment("scheduler_ticks_skipped_total", 1);
            return Ok(Vec::new());
        }
        let _flag = TickFlag(&self.tick_running);
        gauge!("scheduler_tick_running").set(1.0);

        let start = Instant::now();
        let targets = self.targets.targets()?;
        let due: Vec<ServerTarget> = targets
            .into_iter()
            .filter(|t| {
                let interval = t.poll_interval().unwrap_or(self.config.default_interval);
                self.slots.is_due(&t.id, interval, start)
            })
            .collect();

        if due.is_empty() {
            debug!("No servers due");
            return Ok(Vec::new());
        }
        debug!("{} servers due", due.len());

        let reports: Vec<TickReport> = futures::stream::iter(due)
            .map(|target| async move { self.tick_server(target, Start::Cursor).await })
            .buffer_unordered(self.config.max_concurrent_servers.max(1))
            .collect()
            .await;

        histogram!("scheduler_tick_duration_seconds").record(start.elapsed().as_secs_f64());
        Ok(reports)
    }

    /// Process one server now, re-reading files modified within `lookback`.
    ///
    /// Goes through the same per-server path as a scheduled tick, so files
    /// after the stored cursor are drained even when they are older than the
    /// window. Events already applied are not counted again.
    pub async fn process_now(&self, server_id: &str, lookback: Duration) -> Result<TickReport> {
        let target = self
            .targets
            .targets()?
            .into_iter()
            .find(|t| t.id == server_id)
            .ok_or_else(|| Error::UnknownServer(server_id.to_string()))?;

        info!(
            "Processing server {} now (lookback: {}s)",
            server_id,
            lookback.as_secs()
        );
        Ok(self.tick_server(target, Start::Lookback(lookback)).await)
    }

    /// Run ticks every `resolution` until [`stop`](Self::stop) is called.
    ///
    /// Each tick runs in its own task, so a wake-up that arrives while the
    /// previous tick is still going is skipped rather than queued. In-flight
    /// ticks are awaited before returning.
    pub async fn run_periodic(self: Arc<Self>) -> Result<()> {
        info!(
            "Starting scheduler (resolution: {}s, default interval: {}s, max concurrent: {})",
            self.config.resolution.as_secs(),
            self.config.default_interval.as_secs(),
            self.config.max_concurrent_servers
        );

        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
        while self.is_running() {
            let wake = Instant::now();
            in_flight.retain(|handle| !handle.is_finished());

            let scheduler = Arc::clone(&self);
            in_flight.push(tokio::spawn(async move {
                match scheduler.run_tick().await {
                    Ok(reports) if !reports.is_empty() => {
                        let failed = reports
                            .iter()
                            .filter(|r| matches!(r.outcome, TickOutcome::Failed { .. }))
                            .count();
                        info!("Tick complete: {} servers, {} failed", reports.len(), failed);
                    }
                    Ok(_) => {}
                    Err(e) => error!("Tick failed: {}", e),
                }
            }));

            // Wait for the next wake-up (or until stopped)
            let resolution = self.config.resolution;
            while wake.elapsed() < resolution && self.is_running() {
                let remaining = resolution.saturating_sub(wake.elapsed());
                tokio::time::sleep(remaining.min(Duration::from_secs(1))).await;
            }
        }

        info!("Scheduler stopping, waiting for {} ticks", in_flight.len());
        for handle in in_flight {
            if let Err(e) = handle.await {
                error!("Tick task panicked: {}", e);
            }
        }
        info!("Scheduler stopped");
        Ok(())
    }

    /// Run one server's tick and publish its report.
    async fn tick_server(&self, target: ServerTarget, start: Start) -> TickReport {
        if !self.is_running() {
            return self.publish(TickReport::skipped(&target.id, SkipCause::ShuttingDown));
        }
        let Some(slot) = self.slots.try_acquire(&target.id) else {
            debug!("Server {} still busy, skipping", target.id);
            return self.publish(TickReport::skipped(&target.id, SkipCause::AlreadyRunning));
        };

        let started = Instant::now();
        let mut report = TickReport::new(&target.id);
        match self.drive(&target, start, &slot, &mut report).await {
            Ok(cursor) => {
                report.cursor = Some(cursor);
                info!("Server {}: {}", target.id, report.summary());
            }
            Err(e) => {
                counter!(
                    "ingest_fetch_errors_total",
                    "server" => target.id.clone(),
                    "kind" => e.kind().as_str()
                )
                .increment(1);
                match &e {
                    Error::Auth { .. } => error!("Server {}: {}", target.id, e),
                    _ => warn!("Server {}: tick failed, will retry: {}", target.id, e),
                }
                report.outcome = TickOutcome::failed(&e);
            }
        }
        report.duration = started.elapsed();
        histogram!("ingest_server_pass_duration_seconds").record(report.duration.as_secs_f64());

        slot.finish(report.clone());
        drop(slot);
        self.publish(report)
    }

    fn publish(&self, report: TickReport) -> TickReport {
        counter!("scheduler_ticks_total", "outcome" => report.outcome.label()).increment(1);
        // No subscribers is fine
        let _ = self.reports.send(report.clone());
        report
    }

    /// Source lifecycle around [`drain`](Self::drain): the source is
    /// disconnected whatever `drain` returns.
    async fn drive(
        &self,
        target: &ServerTarget,
        start: Start,
        slot: &SlotGuard,
        report: &mut TickReport,
    ) -> Result<FileCursor> {
        let pattern = target.compile_pattern()?;
        let mut source = self.sources.create(target)?;

        let result = self
            .drain(target, &pattern, source.as_mut(), start, slot, report)
            .await;

        if tokio::time::timeout(self.config.remote_timeout, source.disconnect())
            .await
            .is_err()
        {
            warn!("Server {}: disconnect timed out", target.id);
        }
        result
    }

    async fn drain(
        &self,
        target: &ServerTarget,
        pattern: &Regex,
        source: &mut dyn RemoteFileSource,
        start: Start,
        slot: &SlotGuard,
        report: &mut TickReport,
    ) -> Result<FileCursor> {
        slot.set_phase(ServerPhase::Connecting);
        self.with_timeout("connect", source.connect()).await?;
        debug!("Server {}: connected ({})", target.id, source.name());

        slot.set_phase(ServerPhase::Listing);
        let dir = target.remote_dir();
        let listing = self.with_timeout("list", source.list(&dir, pattern)).await?;
        let stored = self.offsets.get(&target.id)?;
        let reread_since = match start {
            Start::Cursor => None,
            Start::Lookback(window) => Some(lookback_cutoff(window, Utc::now())),
        };
        let files = select_files(listing, &stored, reread_since);
        debug!(
            "Server {}: {} files to drain from {}",
            target.id,
            files.len(),
            dir
        );

        slot.set_phase(ServerPhase::Draining);
        let mut pending = stored.clone();
        let mut rewound = false;
        for (index, file) in files.iter().enumerate() {
            if !self.is_running() {
                info!(
                    "Server {}: shutdown requested, stopping after {} files",
                    target.id, report.files
                );
                break;
            }

            let (mut offset, mut line) = match reread_since {
                Some(cutoff) if modified_since(file, cutoff) => (0, 0),
                _ => stored.resume_point(&file.name),
            };
            if offset > file.size {
                warn!(
                    "Server {}: {} shrank below offset {} (now {} bytes), re-reading it",
                    target.id, file.name, offset, file.size
                );
                offset = 0;
                line = 0;
                rewound = true;
            }

            // The newest file may still be written to, so its trailing
            // partial line waits for the next tick.
            let newest = index + 1 == files.len();
            let path = join_path(&dir, &file.name);
            let mut buffer: Vec<u8> = Vec::new();
            loop {
                let read_at = offset + buffer.len() as u64;
                let chunk = self.with_timeout("read", source.read(&path, read_at)).await?;
                report.bytes += chunk.bytes.len() as u64;
                increment_for_server("ingest_bytes_total", &target.id, chunk.bytes.len() as u64);
                let exhausted = chunk.eof || chunk.bytes.is_empty();
                buffer.extend_from_slice(&chunk.bytes);

                let ctx = ChunkContext {
                    server_id: &target.id,
                    file_name: &file.name,
                    lines_before: line,
                    final_chunk: exhausted && !newest,
                    ingested_at: Utc::now(),
                };
                let parsed = parse_chunk(&ctx, &buffer);
                report.parse_errors += parsed.errors.len() as u64;
                report.flagged += parsed.flagged as u64;
                let id = target.id.as_str();
                increment_for_server("parse_records_total", id, parsed.records.len() as u64);
                increment_for_server("parse_errors_total", id, parsed.errors.len() as u64);
                increment_for_server("parse_timestamps_flagged_total", id, parsed.flagged as u64);

                self.apply_records(&target.id, &parsed.records, report)?;

                buffer.drain(..parsed.consumed);
                offset += parsed.consumed as u64;
                line += parsed.lines;
                if exhausted {
                    break;
                }
            }

            pending = FileCursor {
                file_name: file.name.clone(),
                file_modified: file.modified,
                byte_offset: offset,
                line,
            };
            report.files += 1;
            increment_for_server("ingest_files_total", &target.id, 1);
            debug!(
                "Server {}: drained {} to offset {} (line {})",
                target.id, file.name, offset, line
            );
        }

        slot.set_phase(ServerPhase::Committing);
        if pending == stored {
            return Ok(stored);
        }
        if rewound {
            self.offsets.rewind(&target.id, &pending)
        } else {
            self.offsets.commit(&target.id, &pending)
        }
    }

    /// Dedup-filter and apply records in line order.
    ///
    /// A store failure un-marks the failing record so the redo on the next
    /// tick is not suppressed, then aborts the tick.
    fn apply_records(
        &self,
        server_id: &str,
        records: &[RawRecord],
        report: &mut TickReport,
    ) -> Result<()> {
        let mut latest: Option<DateTime<Utc>> = None;
        for record in records {
            if !record.time.flagged {
                latest = latest.max(Some(record.timestamp()));
            }
            if !self.dedupe.is_new(record) {
                report.duplicates += 1;
                continue;
            }
            match self.effects.apply(record) {
                Ok(ApplyOutcome::Applied) => report.applied += 1,
                Ok(ApplyOutcome::Skipped(SkipReason::AlreadyApplied)) => report.duplicates += 1,
                Ok(ApplyOutcome::Skipped(SkipReason::MissingIdentifier)) => {
                    report.data_quality += 1
                }
                Ok(ApplyOutcome::Skipped(SkipReason::Passthrough)) => report.passthrough += 1,
                Err(e) => {
                    self.dedupe.forget(record);
                    return Err(e);
                }
            }
        }

        if let Some(latest) = latest {
            self.dedupe.advance_watermark(server_id, latest);
        }
        Ok(())
    }

    async fn with_timeout<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let after = self.config.remote_timeout;
        match tokio::time::timeout(after, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout { operation, after }),
        }
    }
}

/// Files to drain, in name order: every file at or after the cursor's file,
/// plus, for a lookback, every file modified since `reread_since`.
///
/// Unread files after the cursor are always included, whatever their age, so
/// a lookback never commits a cursor past a file it skipped.
fn select_files(
    listing: Vec<RemoteFile>,
    cursor: &FileCursor,
    reread_since: Option<DateTime<Utc>>,
) -> Vec<RemoteFile> {
    listing
        .into_iter()
        .filter(|f| {
            cursor.is_zero()
                || f.name >= cursor.file_name
                || reread_since.is_some_and(|cutoff| modified_since(f, cutoff))
        })
        .collect()
}

/// Start of a lookback window ending at `now`.
fn lookback_cutoff(window: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Files without a modification time count as recent.
fn modified_since(file: &RemoteFile, cutoff: DateTime<Utc>) -> bool {
    file.modified.is_none_or(|modified| modified >= cutoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticTargets;
    use crate::dedupe::DedupeConfig;
    use crate::error::ErrorKind;
    use crate::source::{FailPoint, MemoryFs, ReadChunk};
    use crate::store::{Database, SqliteOffsetStore};
    use chrono::TimeZone;
    use parking_lot::Mutex;

    const DIR: &str = "/host_7020/actual1/deathlogs";
    const FILE_0: &str = "2024.01.01-00.00.00.csv";
    const FILE_1: &str = "2024.01.01-01.00.00.csv";

    const SCENARIO: &str = "\
2024.01.01-00.00.00;Alice;A;Bob;B;AK47;150
2024.01.01-00.00.05;Bob;B;Bob;B;Falling;0
2024.01.01-00.00.09;Carol;C;Alice;A;M24;400
";

    fn path(name: &str) -> String {
        join_path(DIR, name)
    }

    fn target() -> ServerTarget {
        ServerTarget::new("7020", "host")
    }

    /// Offset store whose commits can be made to fail.
    struct FlakyOffsets {
        inner: SqliteOffsetStore,
        fail_commits: Mutex<usize>,
    }

    impl OffsetStore for FlakyOffsets {
        fn get(&self, server_id: &str) -> Result<FileCursor> {
            self.inner.get(server_id)
        }

        fn commit(&self, server_id: &str, cursor: &FileCursor) -> Result<FileCursor> {
            let mut fail = self.fail_commits.lock();
            if *fail > 0 {
                *fail -= 1;
                return Err(Error::Persist {
                    server_id: server_id.to_string(),
                    reason: "disk full".to_string(),
                });
            }
            drop(fail);
            self.inner.commit(server_id, cursor)
        }

        fn rewind(&self, server_id: &str, cursor: &FileCursor) -> Result<FileCursor> {
            self.inner.rewind(server_id, cursor)
        }
    }

    struct Harness {
        fs: MemoryFs,
        db: Arc<Database>,
        offsets: Arc<FlakyOffsets>,
        scheduler: Arc<Scheduler>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with(MemoryFs::new(), vec![target()], SchedulerConfig::default())
        }

        fn with(fs: MemoryFs, targets: Vec<ServerTarget>, config: SchedulerConfig) -> Self {
            let sources = Arc::new(fs.clone());
            Self::with_sources(fs, sources, targets, config)
        }

        fn with_sources(
            fs: MemoryFs,
            sources: Arc<dyn SourceFactory>,
            targets: Vec<ServerTarget>,
            config: SchedulerConfig,
        ) -> Self {
            let db = Arc::new(Database::open_in_memory().unwrap());
            let offsets = Arc::new(FlakyOffsets {
                inner: SqliteOffsetStore::new(Arc::clone(&db)),
                fail_commits: Mutex::new(0),
            });
            let scheduler = Arc::new(Scheduler::new(
                config,
                Arc::new(StaticTargets::new(targets).unwrap()),
                sources,
                Arc::clone(&offsets) as Arc<dyn OffsetStore>,
                Arc::new(DedupeCoordinator::new(DedupeConfig::default())),
                Arc::new(EffectsPipeline::new(Arc::clone(&db))),
            ));
            Self {
                fs,
                db,
                offsets,
                scheduler,
            }
        }

        /// Same database and files, fresh in-memory state (a restart).
        fn restart(&self) -> Arc<Scheduler> {
            Arc::new(Scheduler::new(
                SchedulerConfig::default(),
                Arc::new(StaticTargets::new(vec![target()]).unwrap()),
                Arc::new(self.fs.clone()),
                Arc::clone(&self.offsets) as Arc<dyn OffsetStore>,
                Arc::new(DedupeCoordinator::default()),
                Arc::new(EffectsPipeline::new(Arc::clone(&self.db))),
            ))
        }

        async fn tick(&self) -> TickReport {
            self.tick_with(&self.scheduler).await
        }

        async fn tick_with(&self, scheduler: &Scheduler) -> TickReport {
            let target = target();
            scheduler.tick_server(target, Start::Cursor).await
        }

        fn cursor(&self) -> FileCursor {
            self.offsets.get("7020").unwrap()
        }

        fn kdr(&self, id: &str) -> (u64, u64, u64) {
            let stat = self
                .scheduler
                .effects()
                .player("7020", id)
                .unwrap()
                .unwrap();
            (stat.kills, stat.deaths, stat.suicides)
        }
    }

    #[tokio::test]
    async fn test_scenario_end_to_end() {
        let h = Harness::new();
        h.fs.put(&path(FILE_0), SCENARIO);

        let report = h.tick().await;
        assert_eq!(report.outcome, TickOutcome::Completed);
        assert_eq!(report.files, 1);
        assert_eq!(report.applied, 3);
        assert_eq!(report.summary(), "1 files, 3 events, 0 errors");

        assert_eq!(h.kdr("A"), (1, 1, 0));
        assert_eq!(h.kdr("B"), (0, 1, 1));
        assert_eq!(h.kdr("C"), (1, 0, 0));
        let effects = h.scheduler.effects();
        assert_eq!(effects.rivalry("7020", "C", "A").unwrap().unwrap().kills, 1);
        assert_eq!(effects.history_count("7020").unwrap(), 3);

        let cursor = h.cursor();
        assert_eq!(cursor.file_name, FILE_0);
        assert_eq!(cursor.byte_offset, SCENARIO.len() as u64);
        assert_eq!(cursor.line, 3);
        assert_eq!(report.cursor, Some(cursor));
        assert_eq!(h.fs.connects(), 1);
        assert_eq!(h.fs.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_second_tick_applies_nothing_new() {
        let h = Harness::new();
        h.fs.put(&path(FILE_0), SCENARIO);
        h.tick().await;

        let report = h.tick().await;
        assert_eq!(report.outcome, TickOutcome::Completed);
        assert_eq!(report.applied, 0);
        assert_eq!(report.duplicates, 0);
        assert_eq!(h.scheduler.effects().history_count("7020").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_appended_lines_are_picked_up() {
        let h = Harness::new();
        h.fs.put(&path(FILE_0), SCENARIO);
        h.tick().await;

        h.fs.append(
            &path(FILE_0),
            b"2024.01.01-00.00.20;Alice;A;Carol;C;SVD;90\n",
        );
        let report = h.tick().await;
        assert_eq!(report.applied, 1);
        assert_eq!(h.kdr("A"), (2, 1, 0));
        assert_eq!(h.cursor().line, 4);
    }

    #[tokio::test]
    async fn test_event_repeated_across_files_counted_once() {
        let h = Harness::new();
        h.fs.put(&path(FILE_0), SCENARIO);
        h.fs.put(
            &path(FILE_1),
            "2024.01.01-00.00.09;Carol;C;Alice;A;M24;400\n\
             2024.01.01-01.00.03;Alice;A;Carol;C;AK47;20\n",
        );

        let report = h.tick().await;
        assert_eq!(report.files, 2);
        assert_eq!(report.applied, 4);
        assert_eq!(report.duplicates, 1);
        assert_eq!(h.kdr("C"), (1, 1, 0));
        assert_eq!(h.cursor().file_name, FILE_1);
    }

    #[tokio::test]
    async fn test_auth_failure_leaves_cursor() {
        let h = Harness::new();
        h.fs.put(&path(FILE_0), SCENARIO);
        h.fs.fail_next(FailPoint::Auth);

        let report = h.tick().await;
        match &report.outcome {
            TickOutcome::Failed { kind, message } => {
                assert_eq!(*kind, ErrorKind::Auth);
                assert!(message.contains("username and password"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(h.cursor().is_zero());
        assert!(report.cursor.is_none());
        assert_eq!(h.scheduler.slots().phase("7020"), ServerPhase::Idle);

        // Next tick recovers
        let report = h.tick().await;
        assert_eq!(report.applied, 3);
    }

    #[tokio::test]
    async fn test_read_failure_disconnects_and_retries() {
        let h = Harness::new();
        h.fs.put(&path(FILE_0), SCENARIO);
        h.fs.fail_next(FailPoint::Read);

        let report = h.tick().await;
        assert!(matches!(
            report.outcome,
            TickOutcome::Failed {
                kind: ErrorKind::Network,
                ..
            }
        ));
        assert_eq!(h.fs.disconnects(), 1);
        assert!(h.cursor().is_zero());

        assert_eq!(h.tick().await.applied, 3);
        assert_eq!(h.fs.disconnects(), 2);
    }

    #[tokio::test]
    async fn test_commit_failure_replay_is_harmless() {
        let h = Harness::new();
        h.fs.put(&path(FILE_0), SCENARIO);
        *h.offsets.fail_commits.lock() = 1;

        let report = h.tick().await;
        assert!(matches!(
            report.outcome,
            TickOutcome::Failed {
                kind: ErrorKind::Persist,
                ..
            }
        ));
        assert!(h.cursor().is_zero());
        let before = (h.kdr("A"), h.kdr("B"), h.kdr("C"));

        // Same process replays the bytes
        let report = h.tick().await;
        assert_eq!(report.outcome, TickOutcome::Completed);
        assert_eq!(report.applied, 0);
        assert_eq!((h.kdr("A"), h.kdr("B"), h.kdr("C")), before);
        assert_eq!(h.cursor().line, 3);
    }

    #[tokio::test]
    async fn test_restart_before_commit_yields_same_aggregates() {
        let h = Harness::new();
        h.fs.put(&path(FILE_0), SCENARIO);
        *h.offsets.fail_commits.lock() = 1;
        h.tick().await;
        let before = (h.kdr("A"), h.kdr("B"), h.kdr("C"));

        let restarted = h.restart();
        let report = h.tick_with(&restarted).await;
        assert_eq!(report.outcome, TickOutcome::Completed);
        assert_eq!(report.applied, 0);
        assert_eq!(report.duplicates, 3);
        assert_eq!((h.kdr("A"), h.kdr("B"), h.kdr("C")), before);
        assert_eq!(h.scheduler.effects().history_count("7020").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_partial_line_waits_for_next_tick() {
        let h = Harness::new();
        let complete = "2024.01.01-00.00.00;Alice;A;Bob;B;AK47;150\n";
        h.fs.put(&path(FILE_0), format!("{}2024.01.01-00.00.09;Car", complete));

        let report = h.tick().await;
        assert_eq!(report.applied, 1);
        assert_eq!(report.parse_errors, 0);
        assert_eq!(h.cursor().byte_offset, complete.len() as u64);

        h.fs.append(&path(FILE_0), b"ol;C;Alice;A;M24;400\n");
        let report = h.tick().await;
        assert_eq!(report.applied, 1);
        assert_eq!(h.kdr("C"), (1, 0, 0));
    }

    #[tokio::test]
    async fn test_older_file_tail_without_newline_is_complete() {
        let h = Harness::new();
        h.fs.put(&path(FILE_0), "2024.01.01-00.00.00;Alice;A;Bob;B;AK47;150");
        h.fs.put(&path(FILE_1), "");

        let report = h.tick().await;
        assert_eq!(report.applied, 1);
        assert_eq!(h.cursor().file_name, FILE_1);
    }

    #[tokio::test]
    async fn test_small_reads_stitch_lines() {
        let fs = MemoryFs::new().with_chunk_size(7);
        let h = Harness::with(fs, vec![target()], SchedulerConfig::default());
        h.fs.put(&path(FILE_0), SCENARIO);

        let report = h.tick().await;
        assert_eq!(report.applied, 3);
        assert_eq!(report.parse_errors, 0);
        assert_eq!(h.cursor().byte_offset, SCENARIO.len() as u64);
        assert!(h.fs.reads() > 3);
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backward() {
        let h = Harness::new();
        h.fs.put(&path(FILE_0), SCENARIO);
        h.fs.put(&path(FILE_1), "2024.01.01-01.00.03;Alice;A;Carol;C;AK47;20\n");
        h.tick().await;
        let after_first = h.cursor();
        assert_eq!(after_first.file_name, FILE_1);

        // A file sorting before the cursor appears late; it is not drained
        h.fs.put(
            &path("2023.12.31-23.00.00.csv"),
            "2023.12.31-23.10.00;Dave;D;Eve;E;AK47;5\n",
        );
        let report = h.tick().await;
        assert_eq!(report.files, 1);
        assert!(!h.cursor().is_behind(&after_first));
        assert!(h.scheduler.effects().player("7020", "D").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_file_is_reread() {
        let h = Harness::new();
        h.fs.put(&path(FILE_0), SCENARIO);
        h.tick().await;

        h.fs.truncate(&path(FILE_0), "2024.01.01-00.30.00;Dave;D;Eve;E;AK47;5\n");
        let report = h.tick().await;
        assert_eq!(report.applied, 1);
        assert_eq!(h.cursor().line, 1);
    }

    #[tokio::test]
    async fn test_process_now_does_not_double_count() {
        let h = Harness::new();
        h.fs.put(&path(FILE_0), SCENARIO);
        h.tick().await;
        let before = (h.kdr("A"), h.kdr("B"), h.kdr("C"));
        let cursor = h.cursor();

        let report = h
            .scheduler
            .process_now("7020", Duration::from_secs(15 * 60))
            .await
            .unwrap();
        assert_eq!(report.outcome, TickOutcome::Completed);
        assert_eq!(report.files, 1);
        assert_eq!(report.applied, 0);
        assert_eq!(report.duplicates, 3);
        assert_eq!((h.kdr("A"), h.kdr("B"), h.kdr("C")), before);
        assert_eq!(h.cursor(), cursor);
    }

    #[tokio::test]
    async fn test_process_now_skips_old_files_behind_cursor() {
        let h = Harness::new();
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        h.fs.put_at(&path(FILE_0), SCENARIO, old);
        h.fs.put(&path(FILE_1), "2024.01.01-01.00.03;Alice;A;Carol;C;AK47;20\n");
        assert_eq!(h.tick().await.applied, 4);

        let report = h
            .scheduler
            .process_now("7020", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(report.files, 1);
        assert_eq!(report.applied, 0);
        assert_eq!(report.duplicates, 1);
        assert_eq!(h.cursor().file_name, FILE_1);
    }

    #[tokio::test]
    async fn test_process_now_reads_unread_files_outside_window() {
        let h = Harness::new();
        h.fs.put(&path(FILE_0), SCENARIO);
        h.tick().await;

        // Server was down longer than the lookback: FILE_1 is unread and old
        let stale = Utc::now() - chrono::Duration::hours(2);
        h.fs.put_at(&path(FILE_1), "2024.01.01-01.00.03;Dave;D;Eve;E;AK47;20\n", stale);
        let file_2 = "2024.01.01-02.00.00.csv";
        h.fs.put(&path(file_2), "2024.01.01-02.00.07;Alice;A;Eve;E;M24;300\n");

        let report = h
            .scheduler
            .process_now("7020", Duration::from_secs(60 * 60))
            .await
            .unwrap();
        assert_eq!(report.outcome, TickOutcome::Completed);
        assert_eq!(report.files, 3);
        assert_eq!(report.applied, 2);
        assert_eq!(report.duplicates, 3);
        assert_eq!(h.kdr("D"), (1, 0, 0));
        assert_eq!(h.kdr("E"), (0, 2, 0));
        assert_eq!(h.cursor().file_name, file_2);

        let report = h.tick().await;
        assert_eq!(report.files, 1);
        assert_eq!(report.applied, 0);
        assert_eq!(h.kdr("D"), (1, 0, 0));
    }

    #[tokio::test]
    async fn test_process_now_unknown_server() {
        let h = Harness::new();
        let err = h
            .scheduler
            .process_now("9999", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownServer(id) if id == "9999"));
    }

    #[tokio::test]
    async fn test_bad_pattern_fails_only_that_server() {
        let mut broken = ServerTarget::new("7021", "host");
        broken.file_pattern = "(".to_string();
        let h = Harness::with(
            MemoryFs::new(),
            vec![target(), broken],
            SchedulerConfig::default(),
        );
        h.fs.put(&path(FILE_0), SCENARIO);

        let mut reports = h.scheduler.run_tick().await.unwrap();
        reports.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].applied, 3);
        assert!(matches!(
            reports[1].outcome,
            TickOutcome::Failed {
                kind: ErrorKind::Config,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_run_tick_respects_poll_interval() {
        let h = Harness::new();
        h.fs.put(&path(FILE_0), SCENARIO);
        let mut reports = h.scheduler.subscribe();

        assert_eq!(h.scheduler.run_tick().await.unwrap().len(), 1);
        assert_eq!(reports.recv().await.unwrap().applied, 3);
        // Not due again until the interval elapses
        assert!(h.scheduler.run_tick().await.unwrap().is_empty());
        assert_eq!(
            h.scheduler.slots().last_report("7020").unwrap().applied,
            3
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_timeout_fails_tick() {
        let config = SchedulerConfig {
            remote_timeout: Duration::from_secs(30),
            ..SchedulerConfig::default()
        };
        let h = Harness::with(MemoryFs::new(), vec![target()], config);
        h.fs.put(&path(FILE_0), SCENARIO);
        h.fs.set_latency(Some(Duration::from_secs(60)));

        let report = h.tick().await;
        match &report.outcome {
            TickOutcome::Failed { kind, message } => {
                assert_eq!(*kind, ErrorKind::Network);
                assert!(message.contains("connect timed out"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(h.cursor().is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_tick_is_skipped() {
        let h = Harness::new();
        h.fs.put(&path(FILE_0), SCENARIO);
        h.fs.set_latency(Some(Duration::from_secs(5)));

        let scheduler = Arc::clone(&h.scheduler);
        let first = tokio::spawn(async move { scheduler.run_tick().await });
        while !h.scheduler.is_tick_running() {
            tokio::task::yield_now().await;
        }

        assert!(h.scheduler.run_tick().await.unwrap().is_empty());
        let reports = first.await.unwrap().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].applied, 3);
        assert!(!h.scheduler.is_tick_running());
    }

    #[tokio::test]
    async fn test_busy_server_is_skipped() {
        let h = Harness::new();
        let _held = h.scheduler.slots.try_acquire("7020").unwrap();
        let report = h.tick().await;
        assert_eq!(
            report.outcome,
            TickOutcome::Skipped {
                reason: SkipCause::AlreadyRunning
            }
        );
    }

    #[tokio::test]
    async fn test_stopped_scheduler_skips_and_run_periodic_returns() {
        let h = Harness::new();
        h.fs.put(&path(FILE_0), SCENARIO);
        h.scheduler.stop();

        let report = h.tick().await;
        assert_eq!(
            report.outcome,
            TickOutcome::Skipped {
                reason: SkipCause::ShuttingDown
            }
        );
        Arc::clone(&h.scheduler).run_periodic().await.unwrap();
        assert!(h.cursor().is_zero());
    }

    /// Sources that stop the scheduler on their first read.
    struct StopOnFirstRead {
        fs: MemoryFs,
        running: Mutex<Option<Arc<AtomicBool>>>,
    }

    impl SourceFactory for StopOnFirstRead {
        fn create(&self, target: &ServerTarget) -> Result<Box<dyn RemoteFileSource>> {
            Ok(Box::new(StoppingSource {
                inner: self.fs.create(target)?,
                running: self.running.lock().take(),
            }))
        }
    }

    struct StoppingSource {
        inner: Box<dyn RemoteFileSource>,
        running: Option<Arc<AtomicBool>>,
    }

    #[async_trait::async_trait]
    impl RemoteFileSource for StoppingSource {
        fn name(&self) -> &'static str {
            "stopping"
        }

        async fn connect(&mut self) -> Result<()> {
            self.inner.connect().await
        }

        async fn list(&mut self, dir: &str, pattern: &Regex) -> Result<Vec<RemoteFile>> {
            self.inner.list(dir, pattern).await
        }

        async fn read(&mut self, path: &str, offset: u64) -> Result<ReadChunk> {
            if let Some(running) = self.running.take() {
                running.store(false, Ordering::SeqCst);
            }
            self.inner.read(path, offset).await
        }

        async fn disconnect(&mut self) {
            self.inner.disconnect().await
        }
    }

    #[tokio::test]
    async fn test_shutdown_mid_tick_commits_current_file() {
        let fs = MemoryFs::new().with_chunk_size(16);
        let sources = Arc::new(StopOnFirstRead {
            fs: fs.clone(),
            running: Mutex::new(None),
        });
        let h = Harness::with_sources(
            fs,
            Arc::clone(&sources) as Arc<dyn SourceFactory>,
            vec![target()],
            SchedulerConfig::default(),
        );
        *sources.running.lock() = Some(h.scheduler.shutdown_flag());
        h.fs.put(&path(FILE_0), SCENARIO);
        h.fs.put(&path(FILE_1), "2024.01.01-01.00.03;Dave;D;Eve;E;AK47;20\n");

        let report = h.tick().await;
        assert!(!h.scheduler.is_running());
        assert_eq!(report.outcome, TickOutcome::Completed);
        assert_eq!(report.files, 1);
        assert_eq!(report.applied, 3);

        // The file being drained when shutdown arrived is finished and committed
        let cursor = h.cursor();
        assert_eq!(cursor.file_name, FILE_0);
        assert_eq!(cursor.byte_offset, SCENARIO.len() as u64);
        assert_eq!(report.cursor, Some(cursor));
        // The next file is never opened
        assert!(h.scheduler.effects().player("7020", "D").unwrap().is_none());
        assert_eq!(h.fs.reads(), SCENARIO.len().div_ceil(16));
        assert_eq!(h.fs.disconnects(), 1);
    }

    #[test]
    fn test_file_selection() {
        let file = |name: &str, modified: Option<DateTime<Utc>>| RemoteFile {
            name: name.to_string(),
            size: 10,
            modified,
        };
        let names = |files: Vec<RemoteFile>| -> Vec<String> {
            files.into_iter().map(|f| f.name).collect()
        };
        let listing = vec![file(FILE_0, None), file(FILE_1, None)];
        assert_eq!(select_files(listing.clone(), &FileCursor::default(), None).len(), 2);
        assert_eq!(
            names(select_files(listing, &FileCursor::start_of(FILE_1), None)),
            vec![FILE_1]
        );

        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let cutoff = lookback_cutoff(Duration::from_secs(15 * 60), now);
        let listing = vec![
            file("2023.12.31-00.00.00.csv", Some(now - chrono::Duration::days(1))),
            file(FILE_0, Some(now - chrono::Duration::minutes(5))),
            file(FILE_1, Some(now - chrono::Duration::hours(2))),
            file("2024.01.01-02.00.00.csv", None),
        ];
        // Old files behind the cursor are left alone; old files after it are
        // still unread and stay in
        assert_eq!(
            names(select_files(listing, &FileCursor::start_of(FILE_1), Some(cutoff))),
            vec![FILE_0, FILE_1, "2024.01.01-02.00.00.csv"]
        );
        assert_eq!(lookback_cutoff(Duration::MAX, now), DateTime::<Utc>::MIN_UTC);
    }
}
