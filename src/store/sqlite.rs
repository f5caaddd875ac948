//! SQLite adapter for the outbox table.

use std::sync::{Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::record::{NewOutboxRecord, OutboxRecord, OutboxStatus, RecordId};

use super::{OutboxStore, OutboxTransaction};

/// Schema of the outbox table and its two indexes.
pub const OUTBOX_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS outbox_event (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        aggregate_type TEXT NOT NULL,
        aggregate_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        topic TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'PENDING',
        created_at TEXT NOT NULL,
        sent_at TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        version INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_outbox_status_created ON outbox_event(status, created_at);
    CREATE INDEX IF NOT EXISTS idx_outbox_aggregate ON outbox_event(aggregate_type, aggregate_id);
";

const SELECT_COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, topic, payload, \
     status, created_at, sent_at, retry_count, last_error, version";

/// Outbox store over a single SQLite connection.
///
/// Business tables may live in the same database: run their statements on
/// [`SqliteTransaction::connection`] so they commit or roll back together
/// with the outbox insert.
///
/// Every transaction holds the one connection until it ends, and a drain
/// keeps its transaction open while it waits on the broker (up to
/// `batch_size × publish_timeout`). Other callers wait at most the lock
/// timeout, then get [`StoreError::Busy`].
pub struct SqliteOutboxStore {
    conn: Mutex<Connection>,
    lock_timeout: Duration,
}

/// How long `begin` and friends wait for the connection by default.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(2);

impl SqliteOutboxStore {
    /// Wrap an open connection and create the outbox table if missing.
    pub fn new(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(OUTBOX_SCHEMA)?;
        debug!("Outbox schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Bound on the wait for the connection while another transaction
    /// holds it.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(DEFAULT_LOCK_TIMEOUT)?;
        Self::new(conn)
    }

    /// Run `f` on the connection outside any outbox transaction
    /// (schema setup for business tables, inspection).
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> StoreResult<T> {
        let conn = self.lock()?;
        Ok(f(&*conn)?)
    }

    pub fn get(&self, id: RecordId) -> StoreResult<Option<OutboxRecord>> {
        let conn = self.lock()?;
        select_by_id(&conn, id)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        let started = Instant::now();
        loop {
            match self.conn.try_lock() {
                Ok(conn) => return Ok(conn),
                Err(TryLockError::Poisoned(_)) => {
                    return Err(StoreError::LockPoisoned("sqlite connection"))
                }
                Err(TryLockError::WouldBlock) => {
                    let waited = started.elapsed();
                    if waited >= self.lock_timeout {
                        warn!(waited_ms = waited.as_millis() as u64, "Outbox connection busy");
                        return Err(StoreError::Busy(waited));
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL.min(self.lock_timeout - waited));
                }
            }
        }
    }
}

fn format_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("bad timestamp {value:?}: {e}")))
}

struct RawRow {
    id: i64,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    topic: String,
    payload: String,
    status: String,
    created_at: String,
    sent_at: Option<String>,
    retry_count: u32,
    last_error: Option<String>,
    version: i64,
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            aggregate_type: row.get(1)?,
            aggregate_id: row.get(2)?,
            event_type: row.get(3)?,
            topic: row.get(4)?,
            payload: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
            sent_at: row.get(8)?,
            retry_count: row.get(9)?,
            last_error: row.get(10)?,
            version: row.get(11)?,
        })
    }

    fn into_record(self) -> StoreResult<OutboxRecord> {
        let status = OutboxStatus::parse(&self.status)
            .ok_or_else(|| StoreError::InvalidData(format!("unknown status {:?}", self.status)))?;
        Ok(OutboxRecord {
            id: RecordId(self.id),
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            topic: self.topic,
            payload: self.payload,
            status,
            created_at: parse_time(&self.created_at)?,
            sent_at: self.sent_at.as_deref().map(parse_time).transpose()?,
            retry_count: self.retry_count,
            last_error: self.last_error,
            version: self.version as u64,
        })
    }
}

fn select_by_id(conn: &Connection, id: RecordId) -> StoreResult<Option<OutboxRecord>> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM outbox_event WHERE id = ?1");
    conn.query_row(&sql, params![id.0], RawRow::read)
        .optional()?
        .map(RawRow::into_record)
        .transpose()
}

fn collect_records(
    rows: impl Iterator<Item = rusqlite::Result<RawRow>>,
) -> StoreResult<Vec<OutboxRecord>> {
    rows.map(|row| row.map_err(StoreError::from).and_then(RawRow::into_record))
        .collect()
}

/// An open `BEGIN IMMEDIATE` transaction holding the store's connection.
pub struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl SqliteTransaction<'_> {
    /// The connection this transaction runs on, for business statements
    /// that must commit atomically with the outbox insert.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl OutboxTransaction for SqliteTransaction<'_> {
    fn insert(&mut self, record: NewOutboxRecord) -> StoreResult<RecordId> {
        self.conn.execute(
            "INSERT INTO outbox_event (aggregate_type, aggregate_id, event_type, topic, payload, status, created_at, retry_count, version)
             VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', ?6, 0, 0)",
            params![
                record.aggregate_type,
                record.aggregate_id,
                record.event_type,
                record.topic,
                record.payload,
                format_time(&record.created_at),
            ],
        )?;
        Ok(RecordId(self.conn.last_insert_rowid()))
    }

    fn fetch_pending(&mut self, limit: usize) -> StoreResult<Vec<OutboxRecord>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM outbox_event
             WHERE status = 'PENDING'
             ORDER BY created_at ASC, id ASC
             LIMIT ?1"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], RawRow::read)?;
        collect_records(rows)
    }

    fn update(&mut self, record: &OutboxRecord, expected_version: u64) -> StoreResult<u64> {
        let changed = self.conn.execute(
            "UPDATE outbox_event
             SET status = ?1, sent_at = ?2, retry_count = ?3, last_error = ?4, version = version + 1
             WHERE id = ?5 AND version = ?6",
            params![
                record.status.as_str(),
                record.sent_at.as_ref().map(format_time),
                record.retry_count,
                record.last_error,
                record.id.0,
                expected_version as i64,
            ],
        )?;

        if changed == 1 {
            return Ok(expected_version + 1);
        }

        let actual: Option<i64> = self
            .conn
            .query_row(
                "SELECT version FROM outbox_event WHERE id = ?1",
                params![record.id.0],
                |row| row.get(0),
            )
            .optional()?;
        match actual {
            Some(actual) => Err(StoreError::VersionConflict {
                id: record.id,
                expected: expected_version,
                actual: actual as u64,
            }),
            None => Err(StoreError::NotFound(record.id)),
        }
    }

    fn commit(mut self) -> StoreResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "Failed to roll back outbox transaction");
            }
        }
    }
}

impl OutboxStore for SqliteOutboxStore {
    type Transaction<'a> = SqliteTransaction<'a>;

    fn begin(&self) -> StoreResult<SqliteTransaction<'_>> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(SqliteTransaction {
            conn,
            finished: false,
        })
    }

    fn delete_older_than(&self, status: OutboxStatus, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM outbox_event
             WHERE status = ?1 AND COALESCE(sent_at, created_at) < ?2",
            params![status.as_str(), format_time(&cutoff)],
        )?;
        Ok(removed)
    }

    fn find_by_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> StoreResult<Vec<OutboxRecord>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM outbox_event
             WHERE aggregate_type = ?1 AND aggregate_id = ?2
             ORDER BY created_at ASC, id ASC"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params![aggregate_type, aggregate_id], RawRow::read)?;
        collect_records(rows)
    }

    fn count_by_status(&self, status: OutboxStatus) -> StoreResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outbox_event WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
