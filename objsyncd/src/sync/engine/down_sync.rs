use std::collections::HashSet;
use std::path::Path;

use objsync_core::ObjectEntry;

use super::{EngineError, Reconciler, duration_secs, now_nanos, now_secs};
use crate::sync::ledger::{EntryUpdate, LedgerEntry, TransferDirection};
use crate::sync::scanner::system_time_nanos;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownSyncReport {
    pub listed: usize,
    pub downloaded: usize,
    pub already_tracked: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum Fetched {
    Downloaded,
    AlreadyTracked,
    Deferred,
}

impl Reconciler {
    /// Downloads every remote object under the prefix that the ledger does not know.
    ///
    /// Only a failed listing aborts the pass; per-object failures are logged,
    /// rolled back and retried in a later cycle.
    pub async fn down_sync(&self) -> Result<DownSyncReport, EngineError> {
        let remote = self.client.list_all(self.layout.remote_prefix()).await?;
        let orphans: HashSet<String> = self
            .ledger
            .list_orphans()
            .await?
            .into_iter()
            .map(|orphan| orphan.path)
            .collect();

        let mut report = DownSyncReport {
            listed: remote.len(),
            ..DownSyncReport::default()
        };
        for entry in &remote {
            if entry.is_dir_marker() || orphans.contains(&entry.key) {
                report.skipped += 1;
                continue;
            }
            match self.fetch_missing(entry).await {
                Ok(Fetched::Downloaded) => report.downloaded += 1,
                Ok(Fetched::AlreadyTracked) => report.already_tracked += 1,
                Ok(Fetched::Deferred) => report.deferred += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(key = %entry.key, error = %err, "download failed");
                }
            }
        }

        tracing::info!(
            listed = report.listed,
            downloaded = report.downloaded,
            failed = report.failed,
            "down-sync pass finished"
        );
        Ok(report)
    }

    async fn fetch_missing(&self, entry: &ObjectEntry) -> Result<Fetched, EngineError> {
        let key = entry.key.as_str();
        if self.ledger.get(key).await?.is_some() {
            return Ok(Fetched::AlreadyTracked);
        }
        let target = self.layout.local_path_for(key)?;
        let now = now_nanos();
        if self.in_backoff(key, TransferDirection::Download, now).await? {
            tracing::debug!(key, "download deferred by backoff");
            return Ok(Fetched::Deferred);
        }

        // The claim keeps up-sync from treating the half-written file as new
        // and GC from deleting the object while the body is in flight.
        self.ledger.insert(&LedgerEntry::claim(key, now)).await?;

        let (mod_time, size) = match self.download(key, &target).await {
            Ok(attributes) => attributes,
            Err(err) => {
                if let Err(rollback) = self.ledger.delete(key).await {
                    tracing::warn!(key, error = %rollback, "failed to release download claim");
                }
                self.note_failure(key, TransferDirection::Download, now, &err)
                    .await;
                return Err(err);
            }
        };

        self.ledger
            .update(
                key,
                &EntryUpdate {
                    mod_time: Some(mod_time),
                    size: Some(size),
                    exists: Some(true),
                    downloading: Some(false),
                },
            )
            .await?;
        self.clear_failure(key, TransferDirection::Download).await;
        tracing::info!(key, size, "downloaded");
        Ok(Fetched::Downloaded)
    }

    /// Fetches the body and returns the attributes of the file as written locally.
    async fn download(&self, key: &str, target: &Path) -> Result<(i64, i64), EngineError> {
        let deadline = now_secs().saturating_add(duration_secs(self.options.download_ttl));
        let url = self
            .client
            .private_download_url(&self.options.download_domain, key, deadline)?;
        self.transfer.download_to_path(&url, target).await?;
        let meta = tokio::fs::metadata(target).await?;
        let size = i64::try_from(meta.len()).unwrap_or(i64::MAX);
        Ok((system_time_nanos(meta.modified()?), size))
    }
}
