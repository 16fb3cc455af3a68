//! Applying deduplicated records to player statistics.
//!
//! [`EffectsPipeline::apply`] is the only writer of statistics. It decides
//! what a record means (kill, suicide, connection, world event, passthrough),
//! rejects records missing the identifiers accounting needs, and delegates
//! the transactional write to the [`StatsStore`]. Applied kills and suicides
//! are broadcast as [`KillNotification`]s for whoever renders them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use killfeed_core::{Player, RawRecord, RecordEvent, RecordKind};
use metrics::counter;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::Result;
use crate::store::{
    ConnectionRecord, Database, KillRecord, PlayerStat, Rivalry, StatsStore, StoreOutcome,
};

/// Capacity of the notification channel. Slow subscribers lag and skip.
const NOTIFICATION_CAPACITY: usize = 1024;

/// Why a record changed nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Its fingerprint is already in the history.
    AlreadyApplied,
    /// A participant id needed for accounting is missing.
    MissingIdentifier,
    /// Unrecognized log line; not for statistics.
    Passthrough,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlreadyApplied => "already_applied",
            Self::MissingIdentifier => "missing_identifier",
            Self::Passthrough => "passthrough",
        }
    }
}

/// Result of [`EffectsPipeline::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Skipped(SkipReason),
}

/// An applied kill or suicide, for live feeds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KillNotification {
    pub server_id: String,
    pub kind: RecordKind,
    /// `None` for suicides.
    pub killer: Option<Player>,
    pub victim: Player,
    pub weapon: String,
    pub distance: f64,
    pub at: DateTime<Utc>,
    pub fingerprint: String,
}

/// Applies records to statistics, at most once per fingerprint.
pub struct EffectsPipeline {
    store: StatsStore,
    notifications: broadcast::Sender<KillNotification>,
}

impl EffectsPipeline {
    pub fn new(db: Arc<Database>) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            store: StatsStore::new(db),
            notifications,
        }
    }

    /// Pipeline on its own in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Arc::new(Database::open_in_memory()?)))
    }

    /// Receive every kill and suicide applied from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<KillNotification> {
        self.notifications.subscribe()
    }

    /// Read access for the presentation layer.
    pub fn store(&self) -> &StatsStore {
        &self.store
    }

    /// Apply one record.
    ///
    /// Returns `Skipped` for records that must not change statistics. An
    /// `Err` means the store failed and nothing was written; the caller may
    /// retry the same record later.
    pub fn apply(&self, record: &RawRecord) -> Result<ApplyOutcome> {
        let outcome = self.apply_inner(record);
        match &outcome {
            Ok(ApplyOutcome::Applied) => {
                counter!("effects_applied_total", "kind" => record.kind().as_str()).increment(1);
            }
            Ok(ApplyOutcome::Skipped(reason)) => {
                counter!("effects_skipped_total", "reason" => reason.as_str()).increment(1);
            }
            Err(e) => {
                counter!("effects_errors_total").increment(1);
                warn!(
                    "Failed to apply {}:{} for {}: {}",
                    record.source.file, record.source.line, record.server_id, e
                );
            }
        }
        outcome
    }

    fn apply_inner(&self, record: &RawRecord) -> Result<ApplyOutcome> {
        let stored = match &record.event {
            RecordEvent::Unrecognized { .. } => {
                return Ok(ApplyOutcome::Skipped(SkipReason::Passthrough));
            }
            RecordEvent::Kill(kill) => {
                if !kill.killer.has_id() || !kill.victim.has_id() {
                    return Ok(self.missing_identifier(record));
                }
                let fingerprint = record.fingerprint().key();
                let stored = self.store.record_kill(&fingerprint, record, kill)?;
                if stored == StoreOutcome::Inserted {
                    self.notify(KillNotification {
                        server_id: record.server_id.clone(),
                        kind: record.kind(),
                        killer: Some(kill.killer.clone()),
                        victim: kill.victim.clone(),
                        weapon: kill.weapon.clone(),
                        distance: kill.distance,
                        at: record.timestamp(),
                        fingerprint,
                    });
                }
                stored
            }
            RecordEvent::Suicide(suicide) => {
                if !suicide.player.has_id() {
                    return Ok(self.missing_identifier(record));
                }
                let fingerprint = record.fingerprint().key();
                let stored = self.store.record_suicide(&fingerprint, record, suicide)?;
                if stored == StoreOutcome::Inserted {
                    self.notify(KillNotification {
                        server_id: record.server_id.clone(),
                        kind: record.kind(),
                        killer: None,
                        victim: suicide.player.clone(),
                        weapon: suicide.weapon.clone(),
                        distance: 0.0,
                        at: record.timestamp(),
                        fingerprint,
                    });
                }
                stored
            }
            RecordEvent::Connection(event) => {
                if !event.player.has_id() && event.player.name.is_empty() {
                    return Ok(self.missing_identifier(record));
                }
                let fingerprint = record.fingerprint().key();
                self.store.record_connection(&fingerprint, record, event)?
            }
            RecordEvent::World(event) => {
                let fingerprint = record.fingerprint().key();
                self.store.record_world_event(&fingerprint, record, event)?
            }
        };

        Ok(match stored {
            StoreOutcome::Inserted => ApplyOutcome::Applied,
            StoreOutcome::AlreadyPresent => {
                debug!(
                    "{}:{} already applied for {}",
                    record.source.file, record.source.line, record.server_id
                );
                ApplyOutcome::Skipped(SkipReason::AlreadyApplied)
            }
        })
    }

    fn missing_identifier(&self, record: &RawRecord) -> ApplyOutcome {
        warn!(
            "{}:{} for {}: {} without participant id, skipped",
            record.source.file,
            record.source.line,
            record.server_id,
            record.kind().as_str()
        );
        ApplyOutcome::Skipped(SkipReason::MissingIdentifier)
    }

    fn notify(&self, notification: KillNotification) {
        // No subscribers is fine
        let _ = self.notifications.send(notification);
    }

    // =========================================================================
    // Read API
    // =========================================================================

    pub fn player(&self, server_id: &str, player_id: &str) -> Result<Option<PlayerStat>> {
        self.store.player(server_id, player_id)
    }

    pub fn rivalry(
        &self,
        server_id: &str,
        killer_id: &str,
        victim_id: &str,
    ) -> Result<Option<Rivalry>> {
        self.store.rivalry(server_id, killer_id, victim_id)
    }

    pub fn nemesis(&self, server_id: &str, player_id: &str) -> Result<Option<String>> {
        self.store.nemesis(server_id, player_id)
    }

    pub fn prey(&self, server_id: &str, player_id: &str) -> Result<Option<String>> {
        self.store.prey(server_id, player_id)
    }

    pub fn history(&self, server_id: &str, limit: usize) -> Result<Vec<KillRecord>> {
        self.store.history(server_id, limit)
    }

    pub fn history_count(&self, server_id: &str) -> Result<u64> {
        self.store.history_count(server_id)
    }

    pub fn top_killers(&self, server_id: &str, limit: usize) -> Result<Vec<PlayerStat>> {
        self.store.top_killers(server_id, limit)
    }

    pub fn connections(&self, server_id: &str, limit: usize) -> Result<Vec<ConnectionRecord>> {
        self.store.connections(server_id, limit)
    }

    pub fn event_counters(&self, server_id: &str) -> Result<Vec<(String, u64)>> {
        self.store.event_counters(server_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use killfeed_core::parse;

    const SCENARIO: &str = "\
2024.01.01-00.00.00;Alice;A;Bob;B;AK47;150
2024.01.01-00.00.05;Bob;B;Bob;B;Falling;0
2024.01.01-00.00.09;Carol;C;Alice;A;M24;400
";

    fn records(data: &str) -> Vec<RawRecord> {
        parse("srv", "2024.01.01-00.00.00.csv", data.as_bytes()).records
    }

    fn stat(effects: &EffectsPipeline, id: &str) -> PlayerStat {
        effects.player("srv", id).unwrap().unwrap()
    }

    #[test]
    fn test_scenario_aggregates() {
        let effects = EffectsPipeline::open_in_memory().unwrap();
        for rec in records(SCENARIO) {
            assert_eq!(effects.apply(&rec).unwrap(), ApplyOutcome::Applied);
        }

        let a = stat(&effects, "A");
        assert_eq!((a.kills, a.deaths, a.suicides), (1, 1, 0));
        let b = stat(&effects, "B");
        assert_eq!((b.kills, b.deaths, b.suicides), (0, 1, 1));
        let c = stat(&effects, "C");
        assert_eq!((c.kills, c.deaths), (1, 0));
        assert_eq!(c.longest_kill, 400.0);

        assert_eq!(effects.rivalry("srv", "C", "A").unwrap().unwrap().kills, 1);
        assert_eq!(effects.history_count("srv").unwrap(), 3);
        assert_eq!(effects.nemesis("srv", "A").unwrap().as_deref(), Some("C"));
        assert_eq!(effects.prey("srv", "A").unwrap().as_deref(), Some("B"));
    }

    #[test]
    fn test_apply_twice_changes_nothing() {
        let effects = EffectsPipeline::open_in_memory().unwrap();
        let recs = records(SCENARIO);
        for rec in &recs {
            effects.apply(rec).unwrap();
        }
        let before = (stat(&effects, "A"), stat(&effects, "B"), stat(&effects, "C"));
        for rec in &recs {
            assert_eq!(
                effects.apply(rec).unwrap(),
                ApplyOutcome::Skipped(SkipReason::AlreadyApplied)
            );
        }
        let after = (stat(&effects, "A"), stat(&effects, "B"), stat(&effects, "C"));
        assert_eq!(before, after);
        assert_eq!(effects.history_count("srv").unwrap(), 3);
    }

    #[test]
    fn test_kills_in_both_directions() {
        let effects = EffectsPipeline::open_in_memory().unwrap();
        let recs = records(
            "2024.01.01-00.00.00;Alice;A;Bob;B;AK47;10\n\
             2024.01.01-00.00.01;Bob;B;Alice;A;SVD;20\n",
        );
        for rec in &recs {
            effects.apply(rec).unwrap();
        }
        assert_eq!(effects.rivalry("srv", "A", "B").unwrap().unwrap().kills, 1);
        assert_eq!(effects.rivalry("srv", "B", "A").unwrap().unwrap().kills, 1);
        let a = stat(&effects, "A");
        assert_eq!((a.kills, a.deaths), (1, 1));
    }

    #[test]
    fn test_fall_death_counts_only_suicide() {
        let effects = EffectsPipeline::open_in_memory().unwrap();
        let recs = records("2024.01.01-00.00.05;Bob;B;Bob;B;Falling;0\n");
        effects.apply(&recs[0]).unwrap();
        let b = stat(&effects, "B");
        assert_eq!((b.kills, b.deaths, b.suicides), (0, 0, 1));
        assert!(effects.rivalry("srv", "B", "B").unwrap().is_none());
        let history = effects.history("srv", 10).unwrap();
        assert_eq!(history[0].suicide_cause.as_deref(), Some("fall"));
    }

    #[test]
    fn test_missing_id_is_data_quality_skip() {
        let effects = EffectsPipeline::open_in_memory().unwrap();
        let recs = records("2024.01.01-00.00.00;Alice;;Bob;B;AK47;10\n");
        assert_eq!(
            effects.apply(&recs[0]).unwrap(),
            ApplyOutcome::Skipped(SkipReason::MissingIdentifier)
        );
        assert!(effects.player("srv", "B").unwrap().is_none());
        assert_eq!(effects.history_count("srv").unwrap(), 0);
    }

    #[test]
    fn test_passthrough_is_skipped() {
        let effects = EffectsPipeline::open_in_memory().unwrap();
        let out = parse(
            "srv",
            "Deadside.log",
            b"[2024.01.01-00.00.05:000][ 12]LogTemp: frame budget exceeded\n",
        );
        assert_eq!(
            effects.apply(&out.records[0]).unwrap(),
            ApplyOutcome::Skipped(SkipReason::Passthrough)
        );
    }

    #[test]
    fn test_world_and_connection_events() {
        let effects = EffectsPipeline::open_in_memory().unwrap();
        let log = "\
[2024.01.01-00.00.01:000][  0]LogSFPS: Mission GA_Town_02_Mis1 switched to ACTIVE
[2024.01.01-00.00.02:000][ 12]LogSFPS: AirDrop switched to Dropping
[2024.01.01-00.00.03:000][ 12]LogOnline: Player |0002b55b successfully registered!
";
        let out = parse("srv", "Deadside.log", log.as_bytes());
        for rec in &out.records {
            assert_eq!(effects.apply(rec).unwrap(), ApplyOutcome::Applied);
        }
        assert_eq!(
            effects.event_counters("srv").unwrap(),
            vec![("airdrop".to_string(), 1), ("mission".to_string(), 1)]
        );
        let player = stat(&effects, "0002b55b");
        assert_eq!(
            player.last_seen,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 3).unwrap())
        );
        assert_eq!(effects.connections("srv", 5).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_notifications_only_for_applied() {
        let effects = EffectsPipeline::open_in_memory().unwrap();
        let mut rx = effects.subscribe();
        let recs = records(SCENARIO);
        for rec in &recs {
            effects.apply(rec).unwrap();
        }
        effects.apply(&recs[0]).unwrap();

        let mut received = Vec::new();
        while let Ok(n) = rx.try_recv() {
            received.push(n);
        }
        assert_eq!(received.len(), 3);
        assert_eq!(received[0].killer.as_ref().map(|p| p.id.as_str()), Some("A"));
        assert_eq!(received[1].kind, RecordKind::FallDeath);
        assert!(received[1].killer.is_none());
    }
}
