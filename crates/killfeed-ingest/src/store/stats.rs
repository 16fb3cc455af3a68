//! Player statistics, rivalries and event history.
//!
//! Every write is one transaction that starts by inserting the event's
//! history row keyed by its fingerprint. If that row already exists the
//! transaction is dropped untouched and the caller learns the event was
//! applied before, which is what makes re-reading a file harmless.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use killfeed_core::{ConnectionEvent, KillEvent, RawRecord, SuicideEvent, WorldEvent};
use rusqlite::{OptionalExtension, Row, Transaction, params};
use serde::Serialize;

use super::{Database, from_millis, to_millis};
use crate::Result;

/// Whether a write changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    /// A row with the same fingerprint exists.
    AlreadyPresent,
}

/// Aggregated statistics of one player on one server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerStat {
    pub server_id: String,
    pub player_id: String,
    pub name: String,
    pub kills: u64,
    pub deaths: u64,
    pub suicides: u64,
    /// Longest kill distance in meters.
    pub longest_kill: f64,
    pub current_kill_streak: u64,
    pub best_kill_streak: u64,
    pub current_death_streak: u64,
    pub worst_death_streak: u64,
    pub last_seen: Option<DateTime<Utc>>,
    /// Player who killed this one most.
    pub nemesis_id: Option<String>,
    /// Player this one killed most.
    pub prey_id: Option<String>,
}

impl PlayerStat {
    /// Kills per death; deaths below one count as one.
    pub fn kdr(&self) -> f64 {
        self.kills as f64 / self.deaths.max(1) as f64
    }
}

/// Directed kill tally between two players.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rivalry {
    pub server_id: String,
    pub killer_id: String,
    pub victim_id: String,
    pub kills: u64,
    pub last_weapon: String,
    pub last_distance: f64,
    pub first_kill_at: DateTime<Utc>,
    pub last_kill_at: DateTime<Utc>,
}

/// One applied kill or suicide.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KillRecord {
    pub fingerprint: String,
    pub server_id: String,
    /// `None` for suicides.
    pub killer_id: Option<String>,
    pub killer_name: Option<String>,
    pub victim_id: String,
    pub victim_name: String,
    pub weapon: String,
    pub distance: f64,
    pub occurred_at: DateTime<Utc>,
    pub time_raw: String,
    pub time_flagged: bool,
    pub is_suicide: bool,
    pub suicide_cause: Option<String>,
    pub source_file: String,
    pub source_line: u64,
    pub ingested_at: DateTime<Utc>,
}

/// One applied connection event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionRecord {
    pub server_id: String,
    pub player_id: String,
    pub player_name: String,
    pub action: String,
    pub occurred_at: DateTime<Utc>,
}

/// Transactional access to the statistics tables.
#[derive(Clone)]
pub struct StatsStore {
    db: Arc<Database>,
}

impl StatsStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store on its own in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Arc::new(Database::open_in_memory()?)))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Apply a player kill: history row, both players' counters and streaks,
    /// the directed rivalry, then nemesis and prey for both players.
    pub fn record_kill(
        &self,
        fingerprint: &str,
        record: &RawRecord,
        kill: &KillEvent,
    ) -> Result<StoreOutcome> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let at = to_millis(record.time.at);

        let inserted = insert_history(
            &tx,
            fingerprint,
            record,
            HistoryRow {
                killer: Some((kill.killer.id.as_str(), kill.killer.name.as_str())),
                victim: (kill.victim.id.as_str(), kill.victim.name.as_str()),
                weapon: &kill.weapon,
                distance: kill.distance,
                suicide_cause: None,
            },
        )?;
        if !inserted {
            return Ok(StoreOutcome::AlreadyPresent);
        }

        tx.execute(
            "INSERT INTO player_stats
                (server_id, player_id, name, kills, longest_kill,
                 current_kill_streak, best_kill_streak, last_seen)
             VALUES (?1, ?2, ?3, 1, ?4, 1, 1, ?5)
             ON CONFLICT(server_id, player_id) DO UPDATE SET
                name = CASE WHEN excluded.name <> '' THEN excluded.name ELSE name END,
                kills = kills + 1,
                longest_kill = MAX(longest_kill, excluded.longest_kill),
                current_kill_streak = current_kill_streak + 1,
                best_kill_streak = MAX(best_kill_streak, current_kill_streak + 1),
                current_death_streak = 0,
                last_seen = MAX(COALESCE(last_seen, 0), excluded.last_seen)",
            params![
                record.server_id,
                kill.killer.id,
                kill.killer.name,
                kill.distance,
                at
            ],
        )?;

        tx.execute(
            "INSERT INTO player_stats
                (server_id, player_id, name, deaths,
                 current_death_streak, worst_death_streak, last_seen)
             VALUES (?1, ?2, ?3, 1, 1, 1, ?4)
             ON CONFLICT(server_id, player_id) DO UPDATE SET
                name = CASE WHEN excluded.name <> '' THEN excluded.name ELSE name END,
                deaths = deaths + 1,
                current_kill_streak = 0,
                current_death_streak = current_death_streak + 1,
                worst_death_streak = MAX(worst_death_streak, current_death_streak + 1),
                last_seen = MAX(COALESCE(last_seen, 0), excluded.last_seen)",
            params![record.server_id, kill.victim.id, kill.victim.name, at],
        )?;

        tx.execute(
            "INSERT INTO rivalries
                (server_id, killer_id, victim_id, kills, last_weapon, last_distance,
                 first_kill_at, last_kill_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?6)
             ON CONFLICT(server_id, killer_id, victim_id) DO UPDATE SET
                kills = kills + 1,
                last_weapon = excluded.last_weapon,
                last_distance = excluded.last_distance,
                first_kill_at = MIN(first_kill_at, excluded.first_kill_at),
                last_kill_at = MAX(last_kill_at, excluded.last_kill_at)",
            params![
                record.server_id,
                kill.killer.id,
                kill.victim.id,
                kill.weapon,
                kill.distance,
                at
            ],
        )?;

        refresh_relations(&tx, &record.server_id, &kill.killer.id)?;
        refresh_relations(&tx, &record.server_id, &kill.victim.id)?;

        tx.commit()?;
        Ok(StoreOutcome::Inserted)
    }

    /// Apply a self-inflicted death: history row and the suicide counter.
    pub fn record_suicide(
        &self,
        fingerprint: &str,
        record: &RawRecord,
        suicide: &SuicideEvent,
    ) -> Result<StoreOutcome> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let inserted = insert_history(
            &tx,
            fingerprint,
            record,
            HistoryRow {
                killer: None,
                victim: (suicide.player.id.as_str(), suicide.player.name.as_str()),
                weapon: &suicide.weapon,
                distance: 0.0,
                suicide_cause: Some(suicide.cause.as_str()),
            },
        )?;
        if !inserted {
            return Ok(StoreOutcome::AlreadyPresent);
        }

        tx.execute(
            "INSERT INTO player_stats (server_id, player_id, name, suicides, last_seen)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(server_id, player_id) DO UPDATE SET
                name = CASE WHEN excluded.name <> '' THEN excluded.name ELSE name END,
                suicides = suicides + 1,
                last_seen = MAX(COALESCE(last_seen, 0), excluded.last_seen)",
            params![
                record.server_id,
                suicide.player.id,
                suicide.player.name,
                to_millis(record.time.at)
            ],
        )?;

        tx.commit()?;
        Ok(StoreOutcome::Inserted)
    }

    /// Append a connection event and refresh the player's name and
    /// last-seen time when the event carries an id.
    pub fn record_connection(
        &self,
        fingerprint: &str,
        record: &RawRecord,
        event: &ConnectionEvent,
    ) -> Result<StoreOutcome> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let at = to_millis(record.time.at);

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO connection_log
                (fingerprint, server_id, player_id, player_name, action, occurred_at, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                fingerprint,
                record.server_id,
                event.player.id,
                event.player.name,
                event.action.as_str(),
                at,
                to_millis(Utc::now())
            ],
        )?;
        if inserted == 0 {
            return Ok(StoreOutcome::AlreadyPresent);
        }

        if event.player.has_id() {
            tx.execute(
                "INSERT INTO player_stats (server_id, player_id, name, last_seen)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(server_id, player_id) DO UPDATE SET
                    name = CASE WHEN excluded.name <> '' THEN excluded.name ELSE name END,
                    last_seen = MAX(COALESCE(last_seen, 0), excluded.last_seen)",
                params![record.server_id, event.player.id, event.player.name, at],
            )?;
        }

        tx.commit()?;
        Ok(StoreOutcome::Inserted)
    }

    /// Append a mission/world event and bump its per-kind counter.
    pub fn record_world_event(
        &self,
        fingerprint: &str,
        record: &RawRecord,
        event: &WorldEvent,
    ) -> Result<StoreOutcome> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO game_events
                (fingerprint, server_id, kind, name, state, occurred_at, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                fingerprint,
                record.server_id,
                event.kind.as_str(),
                event.name,
                event.state,
                to_millis(record.time.at),
                to_millis(Utc::now())
            ],
        )?;
        if inserted == 0 {
            return Ok(StoreOutcome::AlreadyPresent);
        }

        tx.execute(
            "INSERT INTO event_counters (server_id, kind, count) VALUES (?1, ?2, 1)
             ON CONFLICT(server_id, kind) DO UPDATE SET count = count + 1",
            params![record.server_id, event.kind.as_str()],
        )?;

        tx.commit()?;
        Ok(StoreOutcome::Inserted)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn player(&self, server_id: &str, player_id: &str) -> Result<Option<PlayerStat>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM player_stats WHERE server_id = ? AND player_id = ?",
                    PLAYER_COLUMNS
                ),
                [server_id, player_id],
                RawPlayer::from_row,
            )
            .optional()?;
        row.map(RawPlayer::into_stat).transpose()
    }

    /// Players ordered by kills, then fewer deaths, then id.
    pub fn top_killers(&self, server_id: &str, limit: usize) -> Result<Vec<PlayerStat>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM player_stats WHERE server_id = ? AND kills > 0
             ORDER BY kills DESC, deaths ASC, player_id ASC LIMIT ?",
            PLAYER_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![server_id, limit as i64], RawPlayer::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawPlayer::into_stat).collect()
    }

    pub fn rivalry(
        &self,
        server_id: &str,
        killer_id: &str,
        victim_id: &str,
    ) -> Result<Option<Rivalry>> {
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT kills, last_weapon, last_distance, first_kill_at, last_kill_at
                 FROM rivalries WHERE server_id = ? AND killer_id = ? AND victim_id = ?",
                [server_id, killer_id, victim_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(kills, weapon, distance, first, last)| {
            Ok(Rivalry {
                server_id: server_id.to_string(),
                killer_id: killer_id.to_string(),
                victim_id: victim_id.to_string(),
                kills: kills.max(0) as u64,
                last_weapon: weapon,
                last_distance: distance,
                first_kill_at: from_millis(first)?,
                last_kill_at: from_millis(last)?,
            })
        })
        .transpose()
    }

    /// The player who killed `player_id` most.
    pub fn nemesis(&self, server_id: &str, player_id: &str) -> Result<Option<String>> {
        Ok(self
            .player(server_id, player_id)?
            .and_then(|p| p.nemesis_id))
    }

    /// The player `player_id` killed most.
    pub fn prey(&self, server_id: &str, player_id: &str) -> Result<Option<String>> {
        Ok(self.player(server_id, player_id)?.and_then(|p| p.prey_id))
    }

    /// Most recent history rows, returned oldest first.
    pub fn history(&self, server_id: &str, limit: usize) -> Result<Vec<KillRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT fingerprint, killer_id, killer_name, victim_id, victim_name, weapon,
                    distance, occurred_at, time_raw, time_flagged, is_suicide, suicide_cause,
                    source_file, source_line, ingested_at
             FROM (
                SELECT * FROM kill_history WHERE server_id = ?
                ORDER BY occurred_at DESC, id DESC LIMIT ?
             )
             ORDER BY occurred_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![server_id, limit as i64], |row| {
                Ok(RawKill {
                    fingerprint: row.get(0)?,
                    killer_id: row.get(1)?,
                    killer_name: row.get(2)?,
                    victim_id: row.get(3)?,
                    victim_name: row.get(4)?,
                    weapon: row.get(5)?,
                    distance: row.get(6)?,
                    occurred_at: row.get(7)?,
                    time_raw: row.get(8)?,
                    time_flagged: row.get(9)?,
                    is_suicide: row.get(10)?,
                    suicide_cause: row.get(11)?,
                    source_file: row.get(12)?,
                    source_line: row.get(13)?,
                    ingested_at: row.get(14)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|r| {
                Ok(KillRecord {
                    fingerprint: r.fingerprint,
                    server_id: server_id.to_string(),
                    killer_id: r.killer_id,
                    killer_name: r.killer_name,
                    victim_id: r.victim_id,
                    victim_name: r.victim_name,
                    weapon: r.weapon,
                    distance: r.distance,
                    occurred_at: from_millis(r.occurred_at)?,
                    time_raw: r.time_raw,
                    time_flagged: r.time_flagged,
                    is_suicide: r.is_suicide,
                    suicide_cause: r.suicide_cause,
                    source_file: r.source_file,
                    source_line: r.source_line.max(0) as u64,
                    ingested_at: from_millis(r.ingested_at)?,
                })
            })
            .collect()
    }

    pub fn history_count(&self, server_id: &str) -> Result<u64> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM kill_history WHERE server_id = ?",
            [server_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Most recent connection events, returned oldest first.
    pub fn connections(&self, server_id: &str, limit: usize) -> Result<Vec<ConnectionRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT player_id, player_name, action, occurred_at FROM (
                SELECT * FROM connection_log WHERE server_id = ?
                ORDER BY occurred_at DESC, id DESC LIMIT ?
             )
             ORDER BY occurred_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![server_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(player_id, player_name, action, at)| {
                Ok(ConnectionRecord {
                    server_id: server_id.to_string(),
                    player_id,
                    player_name,
                    action,
                    occurred_at: from_millis(at)?,
                })
            })
            .collect()
    }

    /// World-event counters as `(kind, count)`, ordered by kind.
    pub fn event_counters(&self, server_id: &str) -> Result<Vec<(String, u64)>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT kind, count FROM event_counters WHERE server_id = ? ORDER BY kind",
        )?;
        let rows = stmt
            .query_map([server_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

struct HistoryRow<'a> {
    killer: Option<(&'a str, &'a str)>,
    victim: (&'a str, &'a str),
    weapon: &'a str,
    distance: f64,
    suicide_cause: Option<&'static str>,
}

/// Insert the history row; `false` if the fingerprint was already stored.
fn insert_history(
    tx: &Transaction<'_>,
    fingerprint: &str,
    record: &RawRecord,
    row: HistoryRow<'_>,
) -> Result<bool> {
    let changed = tx.execute(
        "INSERT OR IGNORE INTO kill_history
            (fingerprint, server_id, killer_id, killer_name, victim_id, victim_name,
             weapon, distance, occurred_at, time_raw, time_flagged, is_suicide,
             suicide_cause, source_file, source_line, ingested_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            fingerprint,
            record.server_id,
            row.killer.map(|(id, _)| id),
            row.killer.map(|(_, name)| name),
            row.victim.0,
            row.victim.1,
            row.weapon,
            row.distance,
            to_millis(record.time.at),
            record.time.raw,
            record.time.flagged,
            row.killer.is_none(),
            row.suicide_cause,
            record.source.file,
            record.source.line as i64,
            to_millis(Utc::now()),
        ],
    )?;
    Ok(changed > 0)
}

/// Recompute nemesis and prey of one player from the rivalry table.
///
/// Ties go to the higher tally, then the most recent kill, then the lowest id.
fn refresh_relations(tx: &Transaction<'_>, server_id: &str, player_id: &str) -> Result<()> {
    let nemesis: Option<String> = tx
        .query_row(
            "SELECT killer_id FROM rivalries WHERE server_id = ? AND victim_id = ?
             ORDER BY kills DESC, last_kill_at DESC, killer_id ASC LIMIT 1",
            [server_id, player_id],
            |row| row.get(0),
        )
        .optional()?;
    let prey: Option<String> = tx
        .query_row(
            "SELECT victim_id FROM rivalries WHERE server_id = ? AND killer_id = ?
             ORDER BY kills DESC, last_kill_at DESC, victim_id ASC LIMIT 1",
            [server_id, player_id],
            |row| row.get(0),
        )
        .optional()?;

    tx.execute(
        "UPDATE player_stats SET nemesis_id = ?1, prey_id = ?2
         WHERE server_id = ?3 AND player_id = ?4",
        params![nemesis, prey, server_id, player_id],
    )?;
    Ok(())
}

const PLAYER_COLUMNS: &str = "server_id, player_id, name, kills, deaths, suicides, longest_kill,
    current_kill_streak, best_kill_streak, current_death_streak, worst_death_streak,
    last_seen, nemesis_id, prey_id";

struct RawPlayer {
    server_id: String,
    player_id: String,
    name: String,
    counters: [i64; 7],
    longest_kill: f64,
    last_seen: Option<i64>,
    nemesis_id: Option<String>,
    prey_id: Option<String>,
}

impl RawPlayer {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            server_id: row.get(0)?,
            player_id: row.get(1)?,
            name: row.get(2)?,
            counters: [
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(7)?,
                row.get(8)?,
                row.get(9)?,
                row.get(10)?,
            ],
            longest_kill: row.get(6)?,
            last_seen: row.get(11)?,
            nemesis_id: row.get(12)?,
            prey_id: row.get(13)?,
        })
    }

    fn into_stat(self) -> Result<PlayerStat> {
        let [kills, deaths, suicides, cur_kill, best_kill, cur_death, worst_death] =
            self.counters.map(|c| c.max(0) as u64);
        Ok(PlayerStat {
            server_id: self.server_id,
            player_id: self.player_id,
            name: self.name,
            kills,
            deaths,
            suicides,
            longest_kill: self.longest_kill,
            current_kill_streak: cur_kill,
            best_kill_streak: best_kill,
            current_death_streak: cur_death,
            worst_death_streak: worst_death,
            last_seen: self.last_seen.map(from_millis).transpose()?,
            nemesis_id: self.nemesis_id,
            prey_id: self.prey_id,
        })
    }
}

struct RawKill {
    fingerprint: String,
    killer_id: Option<String>,
    killer_name: Option<String>,
    victim_id: String,
    victim_name: String,
    weapon: String,
    distance: f64,
    occurred_at: i64,
    time_raw: String,
    time_flagged: bool,
    is_suicide: bool,
    suicide_cause: Option<String>,
    source_file: String,
    source_line: i64,
    ingested_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use killfeed_core::{
        ConnectionAction, EventTime, Player, RecordEvent, SourcePosition, SuicideCause,
        WorldEventKind,
    };

    fn record(secs: i64, event: RecordEvent) -> RawRecord {
        RawRecord {
            server_id: "srv".to_string(),
            time: EventTime::parsed(Utc.timestamp_opt(secs, 0).unwrap(), secs.to_string()),
            source: SourcePosition {
                file: "f.csv".to_string(),
                line: 1,
            },
            event,
        }
    }

    fn kill(store: &StatsStore, killer: &str, victim: &str, secs: i64) -> StoreOutcome {
        let event = KillEvent {
            killer: Player::new(killer, format!("{}-name", killer)),
            victim: Player::new(victim, format!("{}-name", victim)),
            weapon: "AK47".to_string(),
            distance: secs as f64,
        };
        let rec = record(secs, RecordEvent::Kill(event.clone()));
        let fp = rec.fingerprint().key();
        store.record_kill(&fp, &rec, &event).unwrap()
    }

    #[test]
    fn test_kill_updates_both_players_and_rivalry() {
        let store = StatsStore::open_in_memory().unwrap();
        assert_eq!(kill(&store, "A", "B", 150), StoreOutcome::Inserted);

        let a = store.player("srv", "A").unwrap().unwrap();
        assert_eq!((a.kills, a.deaths), (1, 0));
        assert_eq!(a.longest_kill, 150.0);
        assert_eq!(a.name, "A-name");
        assert_eq!(a.prey_id.as_deref(), Some("B"));

        let b = store.player("srv", "B").unwrap().unwrap();
        assert_eq!((b.kills, b.deaths), (0, 1));
        assert_eq!(b.nemesis_id.as_deref(), Some("A"));

        let r = store.rivalry("srv", "A", "B").unwrap().unwrap();
        assert_eq!(r.kills, 1);
        assert_eq!(r.last_weapon, "AK47");
        assert!(store.rivalry("srv", "B", "A").unwrap().is_none());
    }

    #[test]
    fn test_same_fingerprint_applied_once() {
        let store = StatsStore::open_in_memory().unwrap();
        assert_eq!(kill(&store, "A", "B", 100), StoreOutcome::Inserted);
        assert_eq!(kill(&store, "A", "B", 100), StoreOutcome::AlreadyPresent);

        assert_eq!(store.player("srv", "A").unwrap().unwrap().kills, 1);
        assert_eq!(store.rivalry("srv", "A", "B").unwrap().unwrap().kills, 1);
        assert_eq!(store.history_count("srv").unwrap(), 1);
    }

    #[test]
    fn test_streaks() {
        let store = StatsStore::open_in_memory().unwrap();
        kill(&store, "A", "B", 1);
        kill(&store, "A", "C", 2);
        kill(&store, "A", "D", 3);
        kill(&store, "B", "A", 4);
        kill(&store, "C", "A", 5);

        let a = store.player("srv", "A").unwrap().unwrap();
        assert_eq!(a.current_kill_streak, 0);
        assert_eq!(a.best_kill_streak, 3);
        assert_eq!(a.current_death_streak, 2);
        assert_eq!(a.worst_death_streak, 2);

        kill(&store, "A", "B", 6);
        let a = store.player("srv", "A").unwrap().unwrap();
        assert_eq!(a.current_kill_streak, 1);
        assert_eq!(a.current_death_streak, 0);
        assert_eq!(a.worst_death_streak, 2);
    }

    #[test]
    fn test_nemesis_tie_break() {
        let store = StatsStore::open_in_memory().unwrap();
        // Two killers with one kill each: the most recent wins
        kill(&store, "Z", "V", 10);
        kill(&store, "Y", "V", 20);
        assert_eq!(store.nemesis("srv", "V").unwrap().as_deref(), Some("Y"));

        // Higher tally beats recency
        kill(&store, "Z", "V", 30);
        kill(&store, "Y", "V", 5);
        kill(&store, "Z", "V", 1);
        assert_eq!(store.nemesis("srv", "V").unwrap().as_deref(), Some("Z"));
        assert_eq!(store.prey("srv", "Z").unwrap().as_deref(), Some("V"));
    }

    #[test]
    fn test_suicide_only_touches_suicides() {
        let store = StatsStore::open_in_memory().unwrap();
        let event = SuicideEvent {
            player: Player::new("B", "Bob"),
            cause: SuicideCause::Fall,
            weapon: "Falling".to_string(),
        };
        let rec = record(50, RecordEvent::Suicide(event.clone()));
        let fp = rec.fingerprint().key();
        assert_eq!(
            store.record_suicide(&fp, &rec, &event).unwrap(),
            StoreOutcome::Inserted
        );
        assert_eq!(
            store.record_suicide(&fp, &rec, &event).unwrap(),
            StoreOutcome::AlreadyPresent
        );

        let b = store.player("srv", "B").unwrap().unwrap();
        assert_eq!((b.kills, b.deaths, b.suicides), (0, 0, 1));

        let history = store.history("srv", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_suicide);
        assert_eq!(history[0].killer_id, None);
        assert_eq!(history[0].suicide_cause.as_deref(), Some("fall"));
    }

    #[test]
    fn test_history_keeps_most_recent_in_order() {
        let store = StatsStore::open_in_memory().unwrap();
        kill(&store, "A", "B", 30);
        kill(&store, "A", "B", 10);
        kill(&store, "A", "B", 20);

        let history = store.history("srv", 2).unwrap();
        let times: Vec<_> = history.iter().map(|h| h.occurred_at.timestamp()).collect();
        assert_eq!(times, vec![20, 30]);
        assert_eq!(store.history_count("srv").unwrap(), 3);
    }

    #[test]
    fn test_top_killers() {
        let store = StatsStore::open_in_memory().unwrap();
        kill(&store, "A", "B", 1);
        kill(&store, "C", "B", 2);
        kill(&store, "C", "A", 3);
        let top = store.top_killers("srv", 10).unwrap();
        let ids: Vec<_> = top.iter().map(|p| p.player_id.as_str()).collect();
        assert_eq!(ids, vec!["C", "A"]);
        assert_eq!(top[0].kdr(), 2.0);
    }

    #[test]
    fn test_connection_updates_last_seen_keeps_name() {
        let store = StatsStore::open_in_memory().unwrap();
        kill(&store, "A", "B", 10);

        let event = ConnectionEvent {
            player: Player::new("A", ""),
            action: ConnectionAction::Registered,
        };
        let rec = record(500, RecordEvent::Connection(event.clone()));
        let fp = rec.fingerprint().key();
        store.record_connection(&fp, &rec, &event).unwrap();
        assert_eq!(
            store.record_connection(&fp, &rec, &event).unwrap(),
            StoreOutcome::AlreadyPresent
        );

        let a = store.player("srv", "A").unwrap().unwrap();
        assert_eq!(a.name, "A-name");
        assert_eq!(a.last_seen.unwrap().timestamp(), 500);
        assert_eq!(store.connections("srv", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_join_without_id_creates_no_player() {
        let store = StatsStore::open_in_memory().unwrap();
        let event = ConnectionEvent {
            player: Player::new("", "Alice"),
            action: ConnectionAction::Joined,
        };
        let rec = record(5, RecordEvent::Connection(event.clone()));
        store
            .record_connection(&rec.fingerprint().key(), &rec, &event)
            .unwrap();
        assert!(store.player("srv", "").unwrap().is_none());
        assert_eq!(store.connections("srv", 10).unwrap()[0].player_name, "Alice");
    }

    #[test]
    fn test_world_event_counters() {
        let store = StatsStore::open_in_memory().unwrap();
        for (secs, kind) in [
            (1, WorldEventKind::Airdrop),
            (2, WorldEventKind::Airdrop),
            (3, WorldEventKind::Convoy),
        ] {
            let event = WorldEvent {
                kind,
                name: kind.as_str().to_string(),
                state: String::new(),
            };
            let rec = record(secs, RecordEvent::World(event.clone()));
            store
                .record_world_event(&rec.fingerprint().key(), &rec, &event)
                .unwrap();
        }
        assert_eq!(
            store.event_counters("srv").unwrap(),
            vec![("airdrop".to_string(), 2), ("convoy".to_string(), 1)]
        );
    }
}
