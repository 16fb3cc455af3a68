//! SQLite schema for cursors, player statistics and event history.

use rusqlite::{Connection, Result};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
///
/// Creates all tables if they don't exist. A database written by a newer
/// binary is refused rather than silently misread.
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(rusqlite::Error::InvalidParameterName(format!(
            "database schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        )));
    }

    Ok(())
}

/// Get the current schema version (0 if not initialized).
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Per-server ingestion cursor
        CREATE TABLE IF NOT EXISTS file_cursors (
            server_id TEXT PRIMARY KEY,
            file_name TEXT NOT NULL,
            file_modified INTEGER,
            byte_offset INTEGER NOT NULL,
            line INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Aggregated per-player statistics
        CREATE TABLE IF NOT EXISTS player_stats (
            server_id TEXT NOT NULL,
            player_id TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            kills INTEGER NOT NULL DEFAULT 0,
            deaths INTEGER NOT NULL DEFAULT 0,
            suicides INTEGER NOT NULL DEFAULT 0,
            longest_kill REAL NOT NULL DEFAULT 0,
            current_kill_streak INTEGER NOT NULL DEFAULT 0,
            best_kill_streak INTEGER NOT NULL DEFAULT 0,
            current_death_streak INTEGER NOT NULL DEFAULT 0,
            worst_death_streak INTEGER NOT NULL DEFAULT 0,
            last_seen INTEGER,
            nemesis_id TEXT,
            prey_id TEXT,
            PRIMARY KEY (server_id, player_id)
        );

        -- Directed killer -> victim tallies
        CREATE TABLE IF NOT EXISTS rivalries (
            server_id TEXT NOT NULL,
            killer_id TEXT NOT NULL,
            victim_id TEXT NOT NULL,
            kills INTEGER NOT NULL DEFAULT 0,
            last_weapon TEXT NOT NULL DEFAULT '',
            last_distance REAL NOT NULL DEFAULT 0,
            first_kill_at INTEGER NOT NULL,
            last_kill_at INTEGER NOT NULL,
            PRIMARY KEY (server_id, killer_id, victim_id)
        );

        -- Applied kills and suicides, one row per fingerprint
        CREATE TABLE IF NOT EXISTS kill_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fingerprint TEXT NOT NULL UNIQUE,
            server_id TEXT NOT NULL,
            killer_id TEXT,
            killer_name TEXT,
            victim_id TEXT NOT NULL,
            victim_name TEXT NOT NULL,
            weapon TEXT NOT NULL,
            distance REAL NOT NULL,
            occurred_at INTEGER NOT NULL,
            time_raw TEXT NOT NULL,
            time_flagged INTEGER NOT NULL,
            is_suicide INTEGER NOT NULL,
            suicide_cause TEXT,
            source_file TEXT NOT NULL,
            source_line INTEGER NOT NULL,
            ingested_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS connection_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fingerprint TEXT NOT NULL UNIQUE,
            server_id TEXT NOT NULL,
            player_id TEXT NOT NULL,
            player_name TEXT NOT NULL,
            action TEXT NOT NULL,
            occurred_at INTEGER NOT NULL,
            ingested_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS game_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fingerprint TEXT NOT NULL UNIQUE,
            server_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            state TEXT NOT NULL,
            occurred_at INTEGER NOT NULL,
            ingested_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS event_counters (
            server_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (server_id, kind)
        );

        CREATE INDEX IF NOT EXISTS idx_kill_history_server_time ON kill_history(server_id, occurred_at);
        CREATE INDEX IF NOT EXISTS idx_rivalries_victim ON rivalries(server_id, victim_id);
        CREATE INDEX IF NOT EXISTS idx_player_stats_kills ON player_stats(server_id, kills DESC);
        CREATE INDEX IF NOT EXISTS idx_connection_log_server_time ON connection_log(server_id, occurred_at);
        "#,
    )?;

    Ok(())
}
