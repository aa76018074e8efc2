use std::{fs, path::Path};

use sqlx::{
    Row, SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteRow},
};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const ENTRY_COLUMNS: &str = "path, mod_time, size, exist, downloading, claimed_at";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("path is already tracked: {0}")]
    Duplicate(String),
    #[error("invalid transfer direction: {0}")]
    InvalidDirection(String),
}

/// One tracked file. `mod_time` is nanoseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub path: String,
    pub mod_time: i64,
    pub size: i64,
    pub exists: bool,
    pub downloading: bool,
    pub claimed_at: Option<i64>,
}

impl LedgerEntry {
    /// A file confirmed present on both sides with the given attributes.
    pub fn tracked(path: impl Into<String>, mod_time: i64, size: i64) -> Self {
        Self {
            path: path.into(),
            mod_time,
            size,
            exists: true,
            downloading: false,
            claimed_at: None,
        }
    }

    /// Placeholder reserving `path` while its download is in flight.
    pub fn claim(path: impl Into<String>, now: i64) -> Self {
        Self {
            path: path.into(),
            mod_time: now,
            size: 0,
            exists: true,
            downloading: true,
            claimed_at: Some(now),
        }
    }
}

/// Partial update; `None` leaves the column untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryUpdate {
    pub mod_time: Option<i64>,
    pub size: Option<i64>,
    pub exists: Option<bool>,
    pub downloading: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerFilter {
    All,
    NotExisting,
    Downloading,
    StaleClaims { claimed_before: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Upload => "upload",
            TransferDirection::Download => "download",
        }
    }

    fn parse(value: &str) -> Result<Self, LedgerError> {
        match value {
            "upload" => Ok(TransferDirection::Upload),
            "download" => Ok(TransferDirection::Download),
            other => Err(LedgerError::InvalidDirection(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub path: String,
    pub direction: TransferDirection,
    pub attempt: u32,
    pub retry_at: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanRecord {
    pub path: String,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub recorded_at: i64,
}

pub struct LedgerStore {
    pool: SqlitePool,
}

impl LedgerStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, LedgerError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Opens (creating if needed) the ledger database file at `db_path`.
    pub async fn open(db_path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), LedgerError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn get(&self, path: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM files WHERE path = ?1"
        ))
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| entry_from_row(&row)).transpose()
    }

    /// Inserts a new row; a second row for the same path is rejected with `Duplicate`.
    pub async fn insert(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "INSERT INTO files (path, mod_time, size, exist, downloading, claimed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&entry.path)
        .bind(entry.mod_time)
        .bind(entry.size)
        .bind(if entry.exists { 1 } else { 0 })
        .bind(if entry.downloading { 1 } else { 0 })
        .bind(entry.claimed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Err(LedgerError::Duplicate(entry.path.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Returns `false` when no row matched `path`.
    pub async fn update(&self, path: &str, update: &EntryUpdate) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            "UPDATE files SET
                mod_time = COALESCE(?1, mod_time),
                size = COALESCE(?2, size),
                exist = COALESCE(?3, exist),
                downloading = COALESCE(?4, downloading),
                claimed_at = CASE WHEN ?4 = 0 THEN NULL ELSE claimed_at END
             WHERE path = ?5",
        )
        .bind(update.mod_time)
        .bind(update.size)
        .bind(update.exists.map(i64::from))
        .bind(update.downloading.map(i64::from))
        .bind(path)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Clears `exists` on every row that is not mid-download.
    pub async fn mark_all_not_existing(&self) -> Result<u64, LedgerError> {
        let result = sqlx::query("UPDATE files SET exist = 0 WHERE downloading = 0")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete(&self, path: &str) -> Result<bool, LedgerError> {
        let result = sqlx::query("DELETE FROM files WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_where(&self, filter: LedgerFilter) -> Result<Vec<LedgerEntry>, LedgerError> {
        let base = format!("SELECT {ENTRY_COLUMNS} FROM files");
        let rows = match filter {
            LedgerFilter::All => {
                sqlx::query(&format!("{base} ORDER BY path ASC"))
                    .fetch_all(&self.pool)
                    .await?
            }
            LedgerFilter::NotExisting => {
                sqlx::query(&format!(
                    "{base} WHERE exist = 0 AND downloading = 0 ORDER BY path ASC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
            LedgerFilter::Downloading => {
                sqlx::query(&format!("{base} WHERE downloading = 1 ORDER BY path ASC"))
                    .fetch_all(&self.pool)
                    .await?
            }
            LedgerFilter::StaleClaims { claimed_before } => {
                sqlx::query(&format!(
                    "{base} WHERE downloading = 1 AND (claimed_at IS NULL OR claimed_at < ?1)
                     ORDER BY path ASC"
                ))
                .bind(claimed_before)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(entry_from_row).collect()
    }

    /// Drops every row the last up-sync pass did not observe. Claims are kept.
    pub async fn delete_not_existing(&self) -> Result<u64, LedgerError> {
        let result = sqlx::query("DELETE FROM files WHERE exist = 0 AND downloading = 0")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Removes download claims taken before `claimed_before` and returns their paths.
    pub async fn reclaim_stale_claims(
        &self,
        claimed_before: i64,
    ) -> Result<Vec<String>, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT path FROM files
             WHERE downloading = 1 AND (claimed_at IS NULL OR claimed_at < ?1)
             ORDER BY path ASC",
        )
        .bind(claimed_before)
        .fetch_all(&mut *tx)
        .await?;
        let paths = rows
            .into_iter()
            .map(|row| row.try_get::<String, _>("path"))
            .collect::<Result<Vec<_>, _>>()?;

        sqlx::query(
            "DELETE FROM files WHERE downloading = 1 AND (claimed_at IS NULL OR claimed_at < ?1)",
        )
        .bind(claimed_before)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(paths)
    }

    pub async fn failure(
        &self,
        path: &str,
        direction: TransferDirection,
    ) -> Result<Option<FailureRecord>, LedgerError> {
        let row = sqlx::query(
            "SELECT path, direction, attempt, retry_at, last_error
             FROM transfer_failures WHERE path = ?1 AND direction = ?2",
        )
        .bind(path)
        .bind(direction.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let direction: String = row.try_get("direction")?;
        let attempt: i64 = row.try_get("attempt")?;
        Ok(Some(FailureRecord {
            path: row.try_get("path")?,
            direction: TransferDirection::parse(&direction)?,
            attempt: attempt.max(0) as u32,
            retry_at: row.try_get("retry_at")?,
            last_error: row.try_get("last_error")?,
        }))
    }

    pub async fn record_failure(&self, record: &FailureRecord) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO transfer_failures (path, direction, attempt, retry_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path, direction) DO UPDATE SET
                attempt = excluded.attempt,
                retry_at = excluded.retry_at,
                last_error = excluded.last_error",
        )
        .bind(&record.path)
        .bind(record.direction.as_str())
        .bind(i64::from(record.attempt))
        .bind(record.retry_at)
        .bind(&record.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_failure(
        &self,
        path: &str,
        direction: TransferDirection,
    ) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM transfer_failures WHERE path = ?1 AND direction = ?2")
            .bind(path)
            .bind(direction.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records (or bumps the attempt count of) a remote object left behind by a failed delete.
    pub async fn record_orphan(
        &self,
        path: &str,
        last_error: &str,
        now: i64,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO orphans (path, attempt, last_error, recorded_at)
             VALUES (?1, 1, ?2, ?3)
             ON CONFLICT(path) DO UPDATE SET
                attempt = orphans.attempt + 1,
                last_error = excluded.last_error",
        )
        .bind(path)
        .bind(last_error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_orphans(&self) -> Result<Vec<OrphanRecord>, LedgerError> {
        let rows = sqlx::query(
            "SELECT path, attempt, last_error, recorded_at FROM orphans ORDER BY path ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let attempt: i64 = row.try_get("attempt")?;
            out.push(OrphanRecord {
                path: row.try_get("path")?,
                attempt: attempt.max(0) as u32,
                last_error: row.try_get("last_error")?,
                recorded_at: row.try_get("recorded_at")?,
            });
        }
        Ok(out)
    }

    pub async fn delete_orphan(&self, path: &str) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM orphans WHERE path = ?1")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<LedgerEntry, LedgerError> {
    let exists: i64 = row.try_get("exist")?;
    let downloading: i64 = row.try_get("downloading")?;
    Ok(LedgerEntry {
        path: row.try_get("path")?,
        mod_time: row.try_get("mod_time")?,
        size: row.try_get("size")?,
        exists: exists != 0,
        downloading: downloading != 0,
        claimed_at: row.try_get("claimed_at")?,
    })
}

#[cfg(test)]
#[path = "ledger_tests.rs"]
mod tests;
