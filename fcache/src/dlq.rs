//! Durable dead-letter store for mutations the remote store rejected.

use crate::errors::{CacheError, Result};
use crate::models::{DlqEntry, DlqStatus, NewDlqEntry};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

pub trait DeadLetterStore: Send + Sync {
    /// Inserts `entry`, keeping one row per `event_id`.
    ///
    /// A row still PENDING is left as is. A PROCESSED or FAILED row is reopened
    /// as PENDING with a fresh retry budget, since the same relation mutation can
    /// fail again after an earlier failure was replayed. Returns whether a row
    /// was written.
    fn upsert_if_absent(&self, entry: &NewDlqEntry) -> Result<bool>;

    /// PENDING rows, and FAILED rows with `retry_count < max_retries`, oldest first.
    fn find_pending(&self, limit: usize, max_retries: u32) -> Result<Vec<DlqEntry>>;

    fn mark_processed(&self, id: i64) -> Result<()>;

    /// Records a failed attempt and returns the new retry count.
    fn increment_retry(&self, id: i64, error: &str) -> Result<u32>;

    fn get_by_event_id(&self, event_id: &str) -> Result<Option<DlqEntry>>;

    fn list(&self, status: Option<DlqStatus>, limit: usize) -> Result<Vec<DlqEntry>>;

    fn count(&self) -> Result<u64>;
}

const ENTRY_COLUMNS: &str = "id, event_id, mutation_type, owner_id, target_id, score_delta, \
     status, retry_count, created_at, updated_at, last_error";

pub struct SqliteDeadLetterStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDeadLetterStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CacheError::Config("dead-letter connection lock poisoned".into()))
    }

    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS dead_letter (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL,
                mutation_type TEXT NOT NULL,
                owner_id INTEGER NOT NULL,
                target_id INTEGER NOT NULL,
                score_delta REAL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_error TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_dead_letter_event_id ON dead_letter (event_id);
            CREATE INDEX IF NOT EXISTS idx_dead_letter_status ON dead_letter (status, id);
            COMMIT;",
        )?;
        Ok(())
    }
}

fn parse_text<T>(idx: usize, value: String) -> rusqlite::Result<T>
where
    T: FromStr<Err = CacheError>,
{
    value
        .parse()
        .map_err(|err: CacheError| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<DlqEntry> {
    Ok(DlqEntry {
        id: row.get(0)?,
        event_id: row.get(1)?,
        mutation_type: parse_text(2, row.get(2)?)?,
        owner_id: row.get(3)?,
        target_id: row.get(4)?,
        score_delta: row.get(5)?,
        status: parse_text(6, row.get(6)?)?,
        retry_count: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        last_error: row.get(10)?,
    })
}

impl DeadLetterStore for SqliteDeadLetterStore {
    fn upsert_if_absent(&self, entry: &NewDlqEntry) -> Result<bool> {
        let conn = self.conn()?;
        let now = chrono::Utc::now().timestamp();
        let written = conn.execute(
            "INSERT INTO dead_letter
                (event_id, mutation_type, owner_id, target_id, score_delta, status, retry_count, created_at, updated_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', 0, ?6, ?6, ?7)
             ON CONFLICT(event_id) DO UPDATE SET
                status = 'PENDING',
                retry_count = 0,
                score_delta = excluded.score_delta,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
             WHERE dead_letter.status <> 'PENDING'",
            params![
                entry.event_id,
                entry.mutation_type.as_str(),
                entry.owner_id,
                entry.target_id,
                entry.score_delta,
                now,
                entry.last_error,
            ],
        )?;
        Ok(written == 1)
    }

    fn find_pending(&self, limit: usize, max_retries: u32) -> Result<Vec<DlqEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM dead_letter
             WHERE status = 'PENDING' OR (status = 'FAILED' AND retry_count < ?1)
             ORDER BY id ASC LIMIT ?2",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![max_retries, limit as i64], entry_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn mark_processed(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE dead_letter SET status = 'PROCESSED', updated_at = ?1, last_error = NULL WHERE id = ?2",
            params![chrono::Utc::now().timestamp(), id],
        )?;
        if updated == 0 {
            return Err(CacheError::NotFound(format!("dead-letter entry {}", id)));
        }
        Ok(())
    }

    fn increment_retry(&self, id: i64, error: &str) -> Result<u32> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE dead_letter
             SET status = 'FAILED', retry_count = retry_count + 1, updated_at = ?1, last_error = ?2
             WHERE id = ?3",
            params![chrono::Utc::now().timestamp(), error, id],
        )?;
        conn.query_row(
            "SELECT retry_count FROM dead_letter WHERE id = ?1",
            params![id],
            |row| row.get::<_, u32>(0),
        )
        .optional()?
        .ok_or_else(|| CacheError::NotFound(format!("dead-letter entry {}", id)))
    }

    fn get_by_event_id(&self, event_id: &str) -> Result<Option<DlqEntry>> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                &format!("SELECT {} FROM dead_letter WHERE event_id = ?1", ENTRY_COLUMNS),
                params![event_id],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    fn list(&self, status: Option<DlqStatus>, limit: usize) -> Result<Vec<DlqEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM dead_letter WHERE (?1 IS NULL OR status = ?1) ORDER BY id ASC LIMIT ?2",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![status.map(|s| s.as_str()), limit as i64],
            entry_from_row,
        )?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM dead_letter", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
