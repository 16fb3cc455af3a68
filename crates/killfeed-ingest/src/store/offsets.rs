//! Durable per-server cursors.

use std::sync::Arc;

use chrono::Utc;
use killfeed_core::FileCursor;
use rusqlite::{OptionalExtension, params};

use super::{Database, from_millis, to_millis};
use crate::{Error, Result};

/// Durable storage of one [`FileCursor`] per server.
///
/// [`commit`](Self::commit) never moves a stored cursor backward.
/// [`rewind`](Self::rewind) is the one exception: it exists for a cursor file
/// that was truncated, and moves the cursor back to the new end of that file.
pub trait OffsetStore: Send + Sync {
    /// Stored cursor, or the zero cursor for a server never committed.
    fn get(&self, server_id: &str) -> Result<FileCursor>;

    /// Persist `cursor` unless it is behind the stored one.
    ///
    /// Returns the cursor now stored. Failures are reported as
    /// [`Error::Persist`] and leave the previous cursor in place.
    fn commit(&self, server_id: &str, cursor: &FileCursor) -> Result<FileCursor>;

    /// Persist `cursor` unconditionally. Used when the cursor's own file was
    /// truncated and the stored offset no longer exists.
    fn rewind(&self, server_id: &str, cursor: &FileCursor) -> Result<FileCursor>;
}

/// [`OffsetStore`] backed by the `file_cursors` table.
#[derive(Clone)]
pub struct SqliteOffsetStore {
    db: Arc<Database>,
}

impl SqliteOffsetStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store on its own in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Arc::new(Database::open_in_memory()?)))
    }

    /// All stored cursors, ordered by server id (for introspection).
    pub fn all(&self) -> Result<Vec<(String, FileCursor)>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT server_id, file_name, file_modified, byte_offset, line
             FROM file_cursors ORDER BY server_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(server_id, file_name, modified, offset, line)| {
                Ok((server_id, cursor_from_row(file_name, modified, offset, line)?))
            })
            .collect()
    }

    fn read(conn: &rusqlite::Connection, server_id: &str) -> Result<FileCursor> {
        let row = conn
            .query_row(
                "SELECT file_name, file_modified, byte_offset, line
                 FROM file_cursors WHERE server_id = ?",
                [server_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((file_name, modified, offset, line)) => {
                cursor_from_row(file_name, modified, offset, line)
            }
            None => Ok(FileCursor::default()),
        }
    }

    fn write(&self, server_id: &str, cursor: &FileCursor, force: bool) -> Result<FileCursor> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        // Unless forced, only a strictly later (file, offset) position
        // replaces the row
        tx.execute(
            "INSERT INTO file_cursors
                (server_id, file_name, file_modified, byte_offset, line, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(server_id) DO UPDATE SET
                file_name = excluded.file_name,
                file_modified = excluded.file_modified,
                byte_offset = excluded.byte_offset,
                line = excluded.line,
                updated_at = excluded.updated_at
             WHERE ?7
                OR excluded.file_name > file_cursors.file_name
                OR (excluded.file_name = file_cursors.file_name
                    AND excluded.byte_offset > file_cursors.byte_offset)",
            params![
                server_id,
                cursor.file_name,
                cursor.file_modified.map(to_millis),
                cursor.byte_offset as i64,
                cursor.line as i64,
                Utc::now().timestamp(),
                force,
            ],
        )?;

        let stored = Self::read(&tx, server_id)?;
        tx.commit()?;
        Ok(stored)
    }
}

fn cursor_from_row(
    file_name: String,
    modified: Option<i64>,
    offset: i64,
    line: i64,
) -> Result<FileCursor> {
    Ok(FileCursor {
        file_name,
        file_modified: modified.map(from_millis).transpose()?,
        byte_offset: offset.max(0) as u64,
        line: line.max(0) as u64,
    })
}

impl OffsetStore for SqliteOffsetStore {
    fn get(&self, server_id: &str) -> Result<FileCursor> {
        let conn = self.db.lock();
        Self::read(&conn, server_id)
    }

    fn commit(&self, server_id: &str, cursor: &FileCursor) -> Result<FileCursor> {
        let stored = self
            .write(server_id, cursor, false)
            .map_err(|e| persist_error(server_id, e))?;

        if cursor.is_behind(&stored) {
            tracing::debug!(
                "Cursor for {} not moved back to {}@{}, kept {}@{}",
                server_id,
                cursor.file_name,
                cursor.byte_offset,
                stored.file_name,
                stored.byte_offset
            );
        }
        Ok(stored)
    }

    fn rewind(&self, server_id: &str, cursor: &FileCursor) -> Result<FileCursor> {
        tracing::info!(
            "Rewinding cursor for {} to {}@{}",
            server_id,
            cursor.file_name,
            cursor.byte_offset
        );
        self.write(server_id, cursor, true)
            .map_err(|e| persist_error(server_id, e))
    }
}

fn persist_error(server_id: &str, e: Error) -> Error {
    Error::Persist {
        server_id: server_id.to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cursor(file: &str, offset: u64, line: u64) -> FileCursor {
        FileCursor {
            file_name: file.to_string(),
            file_modified: None,
            byte_offset: offset,
            line,
        }
    }

    #[test]
    fn test_fresh_store_returns_zero_cursor() {
        let store = SqliteOffsetStore::open_in_memory().unwrap();
        let c = store.get("7020").unwrap();
        assert!(c.is_zero());
        assert_eq!(c.byte_offset, 0);
    }

    #[test]
    fn test_commit_and_read() {
        let store = SqliteOffsetStore::open_in_memory().unwrap();
        let mut c = cursor("2024.01.01-00.00.00.csv", 120, 3);
        c.file_modified = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap());

        let stored = store.commit("7020", &c).unwrap();
        assert_eq!(stored, c);
        assert_eq!(store.get("7020").unwrap(), c);
        assert!(store.get("other").unwrap().is_zero());
    }

    #[test]
    fn test_commit_only_moves_forward() {
        let store = SqliteOffsetStore::open_in_memory().unwrap();
        store
            .commit("7020", &cursor("2024.01.01-01.00.00.csv", 50, 1))
            .unwrap();

        // Earlier file
        let stored = store
            .commit("7020", &cursor("2024.01.01-00.00.00.csv", 900, 30))
            .unwrap();
        assert_eq!(stored.file_name, "2024.01.01-01.00.00.csv");
        assert_eq!(stored.byte_offset, 50);

        // Same file, smaller offset
        let stored = store
            .commit("7020", &cursor("2024.01.01-01.00.00.csv", 10, 0))
            .unwrap();
        assert_eq!(stored.byte_offset, 50);

        // Same file, larger offset
        let stored = store
            .commit("7020", &cursor("2024.01.01-01.00.00.csv", 80, 2))
            .unwrap();
        assert_eq!(stored.byte_offset, 80);

        // Later file, offset resets
        let stored = store
            .commit("7020", &cursor("2024.01.01-02.00.00.csv", 0, 0))
            .unwrap();
        assert_eq!(stored.file_name, "2024.01.01-02.00.00.csv");
        assert_eq!(stored.byte_offset, 0);
    }

    #[test]
    fn test_rewind_moves_back() {
        let store = SqliteOffsetStore::open_in_memory().unwrap();
        store.commit("7020", &cursor("f.csv", 500, 9)).unwrap();
        let stored = store.rewind("7020", &cursor("f.csv", 20, 1)).unwrap();
        assert_eq!(stored.byte_offset, 20);
        assert_eq!(store.get("7020").unwrap().line, 1);
    }

    #[test]
    fn test_all_lists_servers() {
        let store = SqliteOffsetStore::open_in_memory().unwrap();
        store.commit("b", &cursor("f.csv", 1, 1)).unwrap();
        store.commit("a", &cursor("g.csv", 2, 1)).unwrap();
        let all = store.all().unwrap();
        let ids: Vec<_> = all.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        {
            let store = SqliteOffsetStore::new(Arc::new(Database::open(&path).unwrap()));
            store.commit("7020", &cursor("f.csv", 42, 2)).unwrap();
        }
        let store = SqliteOffsetStore::new(Arc::new(Database::open(&path).unwrap()));
        assert_eq!(store.get("7020").unwrap().byte_offset, 42);
    }
}
