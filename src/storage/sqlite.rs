//! `SQLite` backend for the index job queue: schema, pragmas, migrations and
//! the queue operations themselves.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::types::{Job, JobAction};

const SCHEMA_VERSION: i64 = 2;

const MIGRATION_V1: &str = r"
CREATE TABLE IF NOT EXISTS index_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model TEXT NOT NULL,
    model_id INTEGER NOT NULL,
    action TEXT NOT NULL CHECK (action IN ('update', 'destroy')),
    created_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_index_jobs_record ON index_jobs(model, model_id);
";

// Failure bookkeeping for the quarantine policy.
const MIGRATION_V2: &str = r"
ALTER TABLE index_jobs ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;
ALTER TABLE index_jobs ADD COLUMN last_error TEXT;
";

const JOB_COLUMNS: &str = "id, model, model_id, action, created_at, attempts, last_error";

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(path)?;

        apply_pragmas(&mut conn)?;
        init_meta(&mut conn)?;
        migrate(&mut conn)?;

        Ok(Self { conn })
    }

    pub fn raw(&self) -> &Connection {
        &self.conn
    }

    pub fn schema_version(&self) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT value FROM meta WHERE key='schema_version'",
                [],
                |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
            )
            .optional()?
            .ok_or_else(|| Error::Configuration("schema_version missing".into()))
    }

    /// Get current time as milliseconds since epoch.
    pub fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // Job queue
    // -------------------------------------------------------------------------

    /// Record that `record_type`/`record_id` needs `action` applied to the
    /// index, superseding any job already queued for that record.
    pub fn enqueue(&mut self, record_type: &str, record_id: i64, action: JobAction) -> Result<i64> {
        let tx = self.conn.transaction()?;
        let superseded = tx.execute(
            "DELETE FROM index_jobs WHERE model = ? AND model_id = ?",
            params![record_type, record_id],
        )?;
        tx.execute(
            "INSERT INTO index_jobs(model, model_id, action, created_at) VALUES(?,?,?,?)",
            params![record_type, record_id, action.as_str(), Self::now_millis()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        debug!(
            job_id = id,
            record_type,
            record_id,
            action = action.as_str(),
            superseded,
            "enqueued index job"
        );
        Ok(id)
    }

    pub fn enqueue_update(&mut self, record_type: &str, record_id: i64) -> Result<i64> {
        self.enqueue(record_type, record_id, JobAction::Update)
    }

    pub fn enqueue_destroy(&mut self, record_type: &str, record_id: i64) -> Result<i64> {
        self.enqueue(record_type, record_id, JobAction::Destroy)
    }

    pub fn pending_record_types(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT model FROM index_jobs ORDER BY model")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Ids of jobs eligible for a drain, ascending. `max_attempts == 0`
    /// disables quarantine.
    pub fn runnable_job_ids(&self, max_attempts: u32) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM index_jobs WHERE ?1 = 0 OR attempts < ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![max_attempts], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn jobs(&self) -> Result<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM index_jobs ORDER BY id ASC");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], job_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn quarantined_jobs(&self, max_attempts: u32) -> Result<Vec<Job>> {
        if max_attempts == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM index_jobs WHERE attempts >= ? ORDER BY id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![max_attempts], job_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Give every quarantined job a fresh set of attempts.
    pub fn requeue_quarantined(&self) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE index_jobs SET attempts = 0 WHERE attempts > 0",
            [],
        )?)
    }

    /// Start the transaction a single job is applied under. `IMMEDIATE`
    /// takes the database write lock up front, so two drains never apply
    /// the same job.
    pub fn begin_job(&mut self) -> Result<JobTransaction<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(JobTransaction { tx })
    }

    /// Count a failed attempt; returns the new attempt total.
    pub fn record_failure(&self, job_id: i64, error: &str) -> Result<u32> {
        self.conn.execute(
            "UPDATE index_jobs SET attempts = attempts + 1, last_error = ? WHERE id = ?",
            params![error, job_id],
        )?;
        let attempts = self
            .conn
            .query_row(
                "SELECT attempts FROM index_jobs WHERE id = ?",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(attempts.unwrap_or(0))
    }

    pub fn max_job_id(&self) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row("SELECT MAX(id) FROM index_jobs", [], |row| row.get(0))?)
    }

    /// Drop every job at or below `watermark`; later jobs survive for the
    /// next drain.
    pub fn purge_jobs_through(&self, watermark: i64) -> Result<usize> {
        let purged = self
            .conn
            .execute("DELETE FROM index_jobs WHERE id <= ?", params![watermark])?;
        info!(watermark, purged, "purged index jobs covered by rebuild");
        Ok(purged)
    }
}

/// A job-scoped transaction; dropping it without [`commit`](Self::commit)
/// rolls back.
pub struct JobTransaction<'conn> {
    tx: Transaction<'conn>,
}

impl JobTransaction<'_> {
    /// Re-read the job under the lock. `None` means another drain already
    /// consumed it.
    pub fn load(&self, job_id: i64) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM index_jobs WHERE id = ?");
        Ok(self
            .tx
            .query_row(&sql, params![job_id], job_from_row)
            .optional()?)
    }

    pub fn complete(&self, job_id: i64) -> Result<()> {
        self.tx
            .execute("DELETE FROM index_jobs WHERE id = ?", params![job_id])?;
        Ok(())
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let action: String = row.get(3)?;
    let action = action.parse::<JobAction>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::other(e)),
        )
    })?;
    Ok(Job {
        id: row.get(0)?,
        record_type: row.get(1)?,
        record_id: row.get(2)?,
        action,
        created_at: row.get(4)?,
        attempts: row.get(5)?,
        last_error: row.get(6)?,
    })
}

fn apply_pragmas(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        ",
    )?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(())
}

fn init_meta(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;

    let existing: Option<i64> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
        )
        .optional()?;

    if existing.is_none() {
        conn.execute(
            "INSERT INTO meta(key, value) VALUES('schema_version', 0)",
            [],
        )?;
    }

    Ok(())
}

fn migrate(conn: &mut Connection) -> Result<()> {
    let current: i64 = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
        )
        .optional()?
        .unwrap_or(0);

    if current == SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;

    match current {
        0 => {
            tx.execute_batch(MIGRATION_V1)?;
            tx.execute_batch(MIGRATION_V2)?;
        }
        1 => {
            tx.execute_batch(MIGRATION_V2)?;
        }
        v => {
            return Err(Error::Configuration(format!(
                "unsupported job queue schema version {v}"
            )));
        }
    }

    tx.execute(
        "UPDATE meta SET value = ? WHERE key = 'schema_version'",
        params![SCHEMA_VERSION.to_string()],
    )?;

    tx.commit()?;
    info!(from = current, to = SCHEMA_VERSION, "migrated job queue schema");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> SqliteStorage {
        SqliteStorage::open(&dir.path().join("jobs.db")).unwrap()
    }

    #[test]
    fn open_applies_all_migrations() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        assert_eq!(storage.schema_version().unwrap(), SCHEMA_VERSION);

        drop(storage);
        let reopened = SqliteStorage::open(&dir.path().join("jobs.db")).unwrap();
        assert_eq!(reopened.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn enqueue_keeps_only_the_latest_job_per_record() {
        let dir = TempDir::new().unwrap();
        let mut storage = storage(&dir);
        let first = storage.enqueue_update("Article", 1).unwrap();
        storage.enqueue_update("Article", 2).unwrap();
        let last = storage.enqueue_destroy("Article", 1).unwrap();
        assert!(last > first);

        let jobs = storage.jobs().unwrap();
        assert_eq!(jobs.len(), 2);
        let article_one: Vec<_> = jobs.iter().filter(|j| j.record_id == 1).collect();
        assert_eq!(article_one.len(), 1);
        assert_eq!(article_one[0].action, JobAction::Destroy);
        assert_eq!(article_one[0].id, last);
    }

    #[test]
    fn job_ids_are_monotonic_even_after_deletes() {
        let dir = TempDir::new().unwrap();
        let mut storage = storage(&dir);
        let a = storage.enqueue_update("Article", 1).unwrap();
        storage.purge_jobs_through(a).unwrap();
        let b = storage.enqueue_update("Article", 1).unwrap();
        assert!(b > a);
    }

    #[test]
    fn failures_accumulate_until_quarantine() {
        let dir = TempDir::new().unwrap();
        let mut storage = storage(&dir);
        let id = storage.enqueue_update("Article", 1).unwrap();
        storage.enqueue_update("Article", 2).unwrap();

        assert_eq!(storage.record_failure(id, "boom").unwrap(), 1);
        assert_eq!(storage.record_failure(id, "boom again").unwrap(), 2);
        assert_eq!(storage.runnable_job_ids(2).unwrap().len(), 1);
        assert_eq!(storage.runnable_job_ids(0).unwrap().len(), 2);

        let quarantined = storage.quarantined_jobs(2).unwrap();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].last_error.as_deref(), Some("boom again"));

        assert_eq!(storage.requeue_quarantined().unwrap(), 1);
        assert_eq!(storage.runnable_job_ids(2).unwrap().len(), 2);
    }

    #[test]
    fn a_job_transaction_rolls_back_when_dropped() {
        let dir = TempDir::new().unwrap();
        let mut storage = storage(&dir);
        let id = storage.enqueue_update("Article", 1).unwrap();
        {
            let tx = storage.begin_job().unwrap();
            assert!(tx.load(id).unwrap().is_some());
            tx.complete(id).unwrap();
        }
        assert_eq!(storage.jobs().unwrap().len(), 1);

        let tx = storage.begin_job().unwrap();
        tx.complete(id).unwrap();
        tx.commit().unwrap();
        assert!(storage.jobs().unwrap().is_empty());
        assert_eq!(storage.max_job_id().unwrap(), None);
    }
}
