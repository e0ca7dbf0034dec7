use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const SQLITE_CORRUPT: i64 = 11;
const SQLITE_NOTADB: i64 = 26;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metadata store is corrupt: {0}")]
    Corruption(String),
    #[error("concurrent write conflict on {remote_id}")]
    ConcurrentWriteConflict { remote_id: String },
    #[error("database error: {0}")]
    Sqlx(sqlx::Error),
    #[error("migration error: {0}")]
    Migration(sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("no record for {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match corruption_message(&err) {
            Some(message) => StoreError::Corruption(message),
            None => StoreError::Sqlx(err),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        if let sqlx::migrate::MigrateError::Execute(inner) = &err {
            if let Some(message) = corruption_message(inner) {
                return StoreError::Corruption(message);
            }
        }
        StoreError::Migration(err)
    }
}

fn corruption_message(err: &sqlx::Error) -> Option<String> {
    let sqlx::Error::Database(db) = err else {
        return None;
    };
    let primary = db
        .code()
        .and_then(|code| code.parse::<i64>().ok())
        .map(|code| code & 0xff);
    let message = db.message();
    if matches!(primary, Some(SQLITE_CORRUPT | SQLITE_NOTADB))
        || message.contains("not a database")
        || message.contains("malformed")
    {
        Some(message.to_string())
    } else {
        None
    }
}

/// Reads one column. A value of the wrong type is reported as corruption.
fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name).map_err(|err| match err {
        err @ (sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)) => StoreError::Corruption(format!("column {name}: {err}")),
        other => other.into(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    Pending,
    Downloading,
    Verified,
    Failed,
    Missing,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Downloading => "downloading",
            SyncStatus::Verified => "verified",
            SyncStatus::Failed => "failed",
            SyncStatus::Missing => "missing",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "pending" => Ok(SyncStatus::Pending),
            "downloading" => Ok(SyncStatus::Downloading),
            "verified" => Ok(SyncStatus::Verified),
            "failed" => Ok(SyncStatus::Failed),
            "missing" => Ok(SyncStatus::Missing),
            other => Err(StoreError::Corruption(format!("unknown sync status {other:?}"))),
        }
    }
}

/// How a verified copy was checked against the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    HashVerified,
    /// No remote hash was available; size and mtime matched.
    UnverifiedHeuristic,
}

impl Integrity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Integrity::HashVerified => "hash-verified",
            Integrity::UnverifiedHeuristic => "unverified-heuristic",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "hash-verified" => Ok(Integrity::HashVerified),
            "unverified-heuristic" => Ok(Integrity::UnverifiedHeuristic),
            other => Err(StoreError::Corruption(format!("unknown integrity {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRecord {
    pub remote_id: String,
    pub path: String,
    pub content_hash: Option<String>,
    pub size: i64,
    pub remote_modified: Option<i64>,
    pub local_path: Option<String>,
    pub status: SyncStatus,
    pub integrity: Option<Integrity>,
    pub last_attempt_at: Option<i64>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub verified_at: Option<i64>,
    /// Remote creation time, RFC 3339.
    pub created_at: Option<String>,
    pub created_by: Option<String>,
    /// Zero for a record that was never committed.
    pub revision: i64,
}

impl SyncRecord {
    pub fn new(remote_id: impl Into<String>, path: impl Into<String>, size: i64) -> Self {
        Self {
            remote_id: remote_id.into(),
            path: path.into(),
            content_hash: None,
            size,
            remote_modified: None,
            local_path: None,
            status: SyncStatus::Pending,
            integrity: None,
            last_attempt_at: None,
            attempt_count: 0,
            last_error: None,
            verified_at: None,
            created_at: None,
            created_by: None,
            revision: 0,
        }
    }

    fn from_row(row: &SqliteRow) -> Result<Self, StoreError> {
        let status: String = column(row, "status")?;
        let integrity: Option<String> = column(row, "integrity")?;
        let attempt_count: i64 = column(row, "attempt_count")?;
        Ok(Self {
            remote_id: column(row, "remote_id")?,
            path: column(row, "path")?,
            content_hash: column(row, "content_hash")?,
            size: column(row, "size")?,
            remote_modified: column(row, "remote_modified")?,
            local_path: column(row, "local_path")?,
            status: SyncStatus::parse(&status)?,
            integrity: integrity.as_deref().map(Integrity::parse).transpose()?,
            last_attempt_at: column(row, "last_attempt_at")?,
            attempt_count: u32::try_from(attempt_count).unwrap_or(u32::MAX),
            last_error: column(row, "last_error")?,
            verified_at: column(row, "verified_at")?,
            created_at: column(row, "created_at")?,
            created_by: column(row, "created_by")?,
            revision: column(row, "revision")?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub downloading: u64,
    pub verified: u64,
    pub failed: u64,
    pub missing: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.downloading + self.verified + self.failed + self.missing
    }
}

/// Row of the `sync_passes` audit table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub started_at: i64,
    pub finished_at: i64,
    pub phase: String,
    pub partial: bool,
    pub fetched: u64,
    pub skipped: u64,
    pub failed: u64,
    pub missing: u64,
    pub renamed: u64,
    pub failures: Vec<String>,
}

/// Per-key async locks. Entries nobody holds are pruned on the next lock.
#[derive(Default)]
struct KeyedLocks {
    inner: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(key.to_string()).or_default().clone()
        };
        mutex.lock_owned().await
    }
}

pub struct MetadataStore {
    pool: SqlitePool,
    locks: KeyedLocks,
}

const RECORD_COLUMNS: &str = "remote_id, path, content_hash, size, remote_modified, local_path, status, integrity, last_attempt_at, attempt_count, last_error, verified_at, created_at, created_by, revision";

impl MetadataStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: KeyedLocks::default(),
        }
    }

    /// Opens (creating if needed) the database file and runs migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let check: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&self.pool)
            .await?;
        if check != "ok" {
            return Err(StoreError::Corruption(check));
        }
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn get(&self, remote_id: &str) -> Result<Option<SyncRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM sync_records WHERE remote_id = ?1"
        ))
        .bind(remote_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(SyncRecord::from_row).transpose()
    }

    /// Commits `record` if nobody else changed it since it was read.
    ///
    /// A record with `revision == 0` is inserted and conflicts if the id already
    /// exists. Otherwise the stored revision must equal `record.revision`. The
    /// returned record carries the new revision.
    pub async fn upsert(&self, record: &SyncRecord) -> Result<SyncRecord, StoreError> {
        let _guard = self.locks.lock(&record.remote_id).await;

        let result = if record.revision == 0 {
            sqlx::query(
                "INSERT INTO sync_records (
                    remote_id, path, content_hash, size, remote_modified, local_path, status,
                    integrity, last_attempt_at, attempt_count, last_error, verified_at,
                    created_at, created_by, revision
                 )
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 1)
                 ON CONFLICT(remote_id) DO NOTHING",
            )
            .bind(&record.remote_id)
            .bind(&record.path)
            .bind(&record.content_hash)
            .bind(record.size)
            .bind(record.remote_modified)
            .bind(&record.local_path)
            .bind(record.status.as_str())
            .bind(record.integrity.map(|i| i.as_str()))
            .bind(record.last_attempt_at)
            .bind(i64::from(record.attempt_count))
            .bind(&record.last_error)
            .bind(record.verified_at)
            .bind(&record.created_at)
            .bind(&record.created_by)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                "UPDATE sync_records SET
                    path = ?2,
                    content_hash = ?3,
                    size = ?4,
                    remote_modified = ?5,
                    local_path = ?6,
                    status = ?7,
                    integrity = ?8,
                    last_attempt_at = ?9,
                    attempt_count = ?10,
                    last_error = ?11,
                    verified_at = ?12,
                    created_at = ?13,
                    created_by = ?14,
                    revision = revision + 1
                 WHERE remote_id = ?1 AND revision = ?15",
            )
            .bind(&record.remote_id)
            .bind(&record.path)
            .bind(&record.content_hash)
            .bind(record.size)
            .bind(record.remote_modified)
            .bind(&record.local_path)
            .bind(record.status.as_str())
            .bind(record.integrity.map(|i| i.as_str()))
            .bind(record.last_attempt_at)
            .bind(i64::from(record.attempt_count))
            .bind(&record.last_error)
            .bind(record.verified_at)
            .bind(&record.created_at)
            .bind(&record.created_by)
            .bind(record.revision)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 0 {
            return Err(StoreError::ConcurrentWriteConflict {
                remote_id: record.remote_id.clone(),
            });
        }

        let mut committed = record.clone();
        committed.revision = record.revision + 1;
        Ok(committed)
    }

    pub async fn list_all(&self) -> Result<Vec<SyncRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM sync_records ORDER BY remote_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(SyncRecord::from_row).collect()
    }

    /// Flags a record whose remote counterpart vanished. Local bytes and the
    /// rest of the record are left as they are.
    pub async fn mark_missing(&self, remote_id: &str) -> Result<(), StoreError> {
        let _guard = self.locks.lock(remote_id).await;
        let result = sqlx::query(
            "UPDATE sync_records SET status = 'missing', revision = revision + 1 WHERE remote_id = ?1",
        )
        .bind(remote_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(remote_id.to_string()));
        }
        Ok(())
    }

    /// Operator intervention for a record that hit the attempt cap. Returns
    /// `false` when the record exists but is not `failed`.
    pub async fn reset_failed(&self, remote_id: &str) -> Result<bool, StoreError> {
        let _guard = self.locks.lock(remote_id).await;
        let result = sqlx::query(
            "UPDATE sync_records
             SET status = 'pending', attempt_count = 0, last_error = NULL, revision = revision + 1
             WHERE remote_id = ?1 AND status = 'failed'",
        )
        .bind(remote_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        drop(_guard);
        match self.get(remote_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(remote_id.to_string())),
        }
    }

    pub async fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM sync_records GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: String = column(&row, "status")?;
            let n: i64 = column(&row, "n")?;
            let n = u64::try_from(n).unwrap_or(0);
            match SyncStatus::parse(&status)? {
                SyncStatus::Pending => counts.pending = n,
                SyncStatus::Downloading => counts.downloading = n,
                SyncStatus::Verified => counts.verified = n,
                SyncStatus::Failed => counts.failed = n,
                SyncStatus::Missing => counts.missing = n,
            }
        }
        Ok(counts)
    }

    pub async fn record_pass(&self, pass: &PassSummary) -> Result<i64, StoreError> {
        let failures = serde_json::to_string(&pass.failures)
            .map_err(|err| StoreError::Corruption(err.to_string()))?;
        let result = sqlx::query(
            "INSERT INTO sync_passes (
                started_at, finished_at, phase, partial, fetched, skipped, failed, missing, renamed, failures
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(pass.started_at)
        .bind(pass.finished_at)
        .bind(&pass.phase)
        .bind(if pass.partial { 1 } else { 0 })
        .bind(to_i64(pass.fetched))
        .bind(to_i64(pass.skipped))
        .bind(to_i64(pass.failed))
        .bind(to_i64(pass.missing))
        .bind(to_i64(pass.renamed))
        .bind(failures)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn last_pass(&self) -> Result<Option<PassSummary>, StoreError> {
        let row = sqlx::query(
            "SELECT started_at, finished_at, phase, partial, fetched, skipped, failed, missing, renamed, failures
             FROM sync_passes ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let partial: i64 = column(&row, "partial")?;
        let failures: String = column(&row, "failures")?;
        let failures: Vec<String> = serde_json::from_str(&failures)
            .map_err(|err| StoreError::Corruption(format!("pass failures: {err}")))?;
        Ok(Some(PassSummary {
            started_at: column(&row, "started_at")?,
            finished_at: column(&row, "finished_at")?,
            phase: column(&row, "phase")?,
            partial: partial != 0,
            fetched: from_i64(column(&row, "fetched")?),
            skipped: from_i64(column(&row, "skipped")?),
            failed: from_i64(column(&row, "failed")?),
            missing: from_i64(column(&row, "missing")?),
            renamed: from_i64(column(&row, "renamed")?),
            failures,
        }))
    }
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("imctransfer");
    path.push("sync.db");
    Ok(path)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_i64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
