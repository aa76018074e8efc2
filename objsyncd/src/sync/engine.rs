use std::time::Duration;

use objsync_core::{StoreClient, StoreError};
use thiserror::Error;
use time::OffsetDateTime;

use super::backoff::Backoff;
use super::ledger::{FailureRecord, LedgerError, LedgerStore, TransferDirection};
use super::paths::{PathError, SyncLayout, partial_path};
use super::scanner::ScanError;
use super::transfer::{TransferClient, TransferError};

mod down_sync;
mod up_sync;

pub use down_sync::DownSyncReport;
pub use up_sync::{GcReport, UpSyncReport};

const UPLOAD_TOKEN_TTL_SECS: i64 = 3600;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("scan error: {0}")]
    Scan(#[from] ScanError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl EngineError {
    fn is_ledger(&self) -> bool {
        matches!(self, EngineError::Ledger(_))
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    /// Host (optionally with scheme) that serves signed downloads.
    pub download_domain: String,
    pub download_ttl: Duration,
    pub claim_timeout: Duration,
    pub backoff: Backoff,
}

impl ReconcilerOptions {
    pub fn new(download_domain: impl Into<String>) -> Self {
        Self {
            download_domain: download_domain.into(),
            download_ttl: Duration::from_secs(3600),
            claim_timeout: Duration::from_secs(3600),
            backoff: Backoff::new(Duration::from_secs(30), Duration::from_secs(3600), true),
        }
    }
}

/// Outcome of one full cycle. A pass that failed as a whole is `None`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub reclaimed_claims: usize,
    pub orphans_cleared: usize,
    pub down: Option<DownSyncReport>,
    pub up: Option<UpSyncReport>,
}

/// Keeps the sync root and the bucket converged, one cycle at a time.
pub struct Reconciler {
    client: StoreClient,
    ledger: LedgerStore,
    transfer: TransferClient,
    layout: SyncLayout,
    options: ReconcilerOptions,
}

impl Reconciler {
    pub fn new(
        client: StoreClient,
        ledger: LedgerStore,
        transfer: TransferClient,
        layout: SyncLayout,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            client,
            ledger,
            transfer,
            layout,
            options,
        }
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    pub fn layout(&self) -> &SyncLayout {
        &self.layout
    }

    /// Runs stale-claim recovery, orphan cleanup, down-sync, then up-sync with GC.
    ///
    /// Never fails: each pass logs its own errors and the next cycle retries.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let cutoff = now_nanos().saturating_sub(duration_nanos(self.options.claim_timeout));
        match self.reclaim_claims(cutoff).await {
            Ok(count) => report.reclaimed_claims = count,
            Err(err) => tracing::warn!(error = %err, "failed to reclaim stale download claims"),
        }
        match self.retry_orphans().await {
            Ok(count) => report.orphans_cleared = count,
            Err(err) => tracing::warn!(error = %err, "failed to retry orphaned remote deletes"),
        }
        match self.down_sync().await {
            Ok(down) => report.down = Some(down),
            Err(err) => tracing::warn!(error = %err, "down-sync pass aborted"),
        }
        match self.up_sync().await {
            Ok(up) => report.up = Some(up),
            Err(err) => tracing::warn!(error = %err, "up-sync pass aborted"),
        }
        report
    }

    /// Drops every download claim left by a previous process, along with its
    /// partial file, so the keys are fetched again.
    pub async fn recover_interrupted_downloads(&self) -> Result<usize, EngineError> {
        self.reclaim_claims(i64::MAX).await
    }

    async fn reclaim_claims(&self, claimed_before: i64) -> Result<usize, EngineError> {
        let reclaimed = self.ledger.reclaim_stale_claims(claimed_before).await?;
        for key in &reclaimed {
            tracing::info!(key = %key, "reclaimed abandoned download claim");
            let Ok(target) = self.layout.local_path_for(key) else {
                continue;
            };
            match tokio::fs::remove_file(partial_path(&target)).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "failed to remove partial download")
                }
            }
        }
        Ok(reclaimed.len())
    }

    /// Retries remote deletes that failed in an earlier GC pass.
    ///
    /// A key that is tracked again (re-created locally and re-uploaded) is
    /// forgotten instead of deleted.
    async fn retry_orphans(&self) -> Result<usize, EngineError> {
        let mut cleared = 0;
        for orphan in self.ledger.list_orphans().await? {
            if self.ledger.get(&orphan.path).await?.is_some() {
                self.ledger.delete_orphan(&orphan.path).await?;
                cleared += 1;
                continue;
            }
            match self.client.delete(&orphan.path).await {
                Ok(()) => {
                    self.ledger.delete_orphan(&orphan.path).await?;
                    cleared += 1;
                    tracing::info!(key = %orphan.path, "deleted orphaned remote object");
                }
                Err(err) => {
                    tracing::warn!(
                        key = %orphan.path,
                        attempt = orphan.attempt + 1,
                        error = %err,
                        "orphaned remote object still not deleted"
                    );
                    self.ledger
                        .record_orphan(&orphan.path, &err.to_string(), now_nanos())
                        .await?;
                }
            }
        }
        Ok(cleared)
    }

    async fn in_backoff(
        &self,
        key: &str,
        direction: TransferDirection,
        now: i64,
    ) -> Result<bool, EngineError> {
        Ok(self
            .ledger
            .failure(key, direction)
            .await?
            .is_some_and(|record| record.retry_at > now))
    }

    /// Bumps the failure counter for `key`; ledger trouble here is only logged.
    async fn note_failure(
        &self,
        key: &str,
        direction: TransferDirection,
        now: i64,
        err: &EngineError,
    ) {
        let attempt = match self.ledger.failure(key, direction).await {
            Ok(previous) => previous.map_or(1, |r| r.attempt.saturating_add(1)),
            Err(_) => 1,
        };
        let record = FailureRecord {
            path: key.to_string(),
            direction,
            attempt,
            retry_at: self.options.backoff.retry_at(now, attempt),
            last_error: Some(err.to_string()),
        };
        if let Err(ledger_err) = self.ledger.record_failure(&record).await {
            tracing::warn!(key, error = %ledger_err, "failed to record transfer failure");
        }
    }

    async fn clear_failure(&self, key: &str, direction: TransferDirection) {
        if let Err(err) = self.ledger.clear_failure(key, direction).await {
            tracing::warn!(key, error = %err, "failed to clear transfer failure");
        }
    }
}

pub fn now_nanos() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos).unwrap_or(i64::MAX)
}

fn now_secs() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn duration_nanos(value: Duration) -> i64 {
    i64::try_from(value.as_nanos()).unwrap_or(i64::MAX)
}

fn duration_secs(value: Duration) -> i64 {
    i64::try_from(value.as_secs()).unwrap_or(i64::MAX)
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
