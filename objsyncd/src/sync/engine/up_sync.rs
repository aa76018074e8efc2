use super::{EngineError, Reconciler, UPLOAD_TOKEN_TTL_SECS, now_nanos, now_secs};
use crate::sync::ledger::{EntryUpdate, LedgerEntry, LedgerFilter, TransferDirection};
use crate::sync::paths::local_path_under;
use crate::sync::scanner::{LocalFile, scan_local_tree};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpSyncReport {
    pub scanned: usize,
    pub uploaded_new: usize,
    pub uploaded_changed: usize,
    pub unchanged: usize,
    pub in_flight: usize,
    pub deferred: usize,
    pub failed: usize,
    /// `None` when GC was skipped because the pass saw ledger errors.
    pub gc: Option<GcReport>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcReport {
    pub candidates: usize,
    pub deleted_remote: usize,
    pub orphaned: usize,
    pub rows_removed: u64,
}

enum Reconciled {
    UploadedNew,
    UploadedChanged,
    Unchanged,
    InFlight,
    Deferred,
}

impl Reconciler {
    /// Uploads new and changed local files, then garbage-collects what vanished.
    ///
    /// An unreadable sync root aborts the pass before anything is marked, so a
    /// missing mount never reads as "every file was deleted".
    pub async fn up_sync(&self) -> Result<UpSyncReport, EngineError> {
        let root = self.layout.root().to_path_buf();
        let local = tokio::task::spawn_blocking(move || scan_local_tree(&root)).await??;
        self.ledger.mark_all_not_existing().await?;

        let mut report = UpSyncReport {
            scanned: local.len(),
            ..UpSyncReport::default()
        };
        let mut ledger_errors = 0usize;
        for file in &local {
            match self.reconcile_local(file).await {
                Ok(Reconciled::UploadedNew) => report.uploaded_new += 1,
                Ok(Reconciled::UploadedChanged) => report.uploaded_changed += 1,
                Ok(Reconciled::Unchanged) => report.unchanged += 1,
                Ok(Reconciled::InFlight) => report.in_flight += 1,
                Ok(Reconciled::Deferred) => report.deferred += 1,
                Err(err) => {
                    report.failed += 1;
                    if err.is_ledger() {
                        ledger_errors += 1;
                    }
                    tracing::warn!(path = %file.relative_path, error = %err, "upload failed");
                }
            }
        }

        tracing::info!(
            scanned = report.scanned,
            uploaded = report.uploaded_new + report.uploaded_changed,
            failed = report.failed,
            "up-sync pass finished"
        );

        if ledger_errors > 0 {
            // A file whose row could not be marked would look deleted.
            tracing::warn!(ledger_errors, "skipping garbage collection after ledger errors");
            return Ok(report);
        }
        report.gc = Some(self.collect_garbage().await?);
        Ok(report)
    }

    async fn reconcile_local(&self, file: &LocalFile) -> Result<Reconciled, EngineError> {
        let key = self.layout.key_for(&file.relative_path);
        let now = now_nanos();

        let Some(entry) = self.ledger.get(&key).await? else {
            if self.in_backoff(&key, TransferDirection::Upload, now).await? {
                tracing::debug!(key = %key, "upload deferred by backoff");
                return Ok(Reconciled::Deferred);
            }
            if let Err(err) = self.upload(&key, file).await {
                self.note_failure(&key, TransferDirection::Upload, now, &err)
                    .await;
                return Err(err);
            }
            self.ledger
                .insert(&LedgerEntry::tracked(&key, file.mod_time, file.size))
                .await?;
            self.clear_failure(&key, TransferDirection::Upload).await;
            tracing::info!(key = %key, size = file.size, "uploaded new file");
            return Ok(Reconciled::UploadedNew);
        };

        if entry.downloading {
            return Ok(Reconciled::InFlight);
        }

        if entry.mod_time == file.mod_time && entry.size == file.size {
            self.mark_present(&key).await?;
            return Ok(Reconciled::Unchanged);
        }

        // The file is present whatever happens to its upload; only the
        // recorded attributes wait for a successful one.
        self.mark_present(&key).await?;
        if self.in_backoff(&key, TransferDirection::Upload, now).await? {
            tracing::debug!(key = %key, "upload deferred by backoff");
            return Ok(Reconciled::Deferred);
        }
        if let Err(err) = self.upload(&key, file).await {
            self.note_failure(&key, TransferDirection::Upload, now, &err)
                .await;
            return Err(err);
        }
        self.ledger
            .update(
                &key,
                &EntryUpdate {
                    mod_time: Some(file.mod_time),
                    size: Some(file.size),
                    exists: Some(true),
                    downloading: None,
                },
            )
            .await?;
        self.clear_failure(&key, TransferDirection::Upload).await;
        tracing::info!(key = %key, size = file.size, "uploaded changed file");
        Ok(Reconciled::UploadedChanged)
    }

    async fn mark_present(&self, key: &str) -> Result<(), EngineError> {
        self.ledger
            .update(
                key,
                &EntryUpdate {
                    exists: Some(true),
                    ..EntryUpdate::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn upload(&self, key: &str, file: &LocalFile) -> Result<(), EngineError> {
        let source = local_path_under(self.layout.root(), &file.relative_path)?;
        let target = self
            .client
            .upload_target(key, now_secs().saturating_add(UPLOAD_TOKEN_TTL_SECS))?;
        self.transfer.upload_from_path(&target, &source).await?;
        Ok(())
    }

    /// Deletes the remote object of every row the last up-sync did not see,
    /// then drops those rows.
    ///
    /// A failed remote delete is recorded as an orphan and retried in later
    /// cycles; the row goes away regardless, even if the orphan cannot be
    /// recorded.
    pub async fn collect_garbage(&self) -> Result<GcReport, EngineError> {
        let candidates = self.ledger.list_where(LedgerFilter::NotExisting).await?;
        let mut report = GcReport {
            candidates: candidates.len(),
            ..GcReport::default()
        };

        for entry in &candidates {
            match self.client.delete(&entry.path).await {
                Ok(()) => {
                    report.deleted_remote += 1;
                    tracing::info!(key = %entry.path, "deleted remote object");
                }
                Err(err) => {
                    report.orphaned += 1;
                    tracing::warn!(key = %entry.path, error = %err, "remote delete failed");
                    if let Err(ledger_err) = self
                        .ledger
                        .record_orphan(&entry.path, &err.to_string(), now_nanos())
                        .await
                    {
                        tracing::warn!(
                            key = %entry.path,
                            error = %ledger_err,
                            "failed to record orphaned remote object"
                        );
                    }
                }
            }
            self.clear_failure(&entry.path, TransferDirection::Upload)
                .await;
            self.clear_failure(&entry.path, TransferDirection::Download)
                .await;
        }

        report.rows_removed = self.ledger.delete_not_existing().await?;
        if report.candidates > 0 {
            tracing::info!(
                deleted = report.deleted_remote,
                orphaned = report.orphaned,
                "garbage collection finished"
            );
        }
        Ok(report)
    }
}
