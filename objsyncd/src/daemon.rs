use anyhow::Context;
use objsync_core::StoreClient;
use tokio_util::sync::CancellationToken;

pub use crate::config::DaemonConfig;
use crate::sync::backoff::Backoff;
use crate::sync::engine::{CycleReport, Reconciler, ReconcilerOptions};
use crate::sync::ledger::LedgerStore;
use crate::sync::paths::SyncLayout;
use crate::sync::transfer::TransferClient;

pub struct DaemonRuntime {
    config: DaemonConfig,
    reconciler: Reconciler,
}

impl DaemonRuntime {
    /// Opens the ledger, builds the clients and drops download claims left
    /// behind by a previous run.
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let root_meta = tokio::fs::metadata(&config.sync_root)
            .await
            .with_context(|| format!("sync folder {:?} is not accessible", config.sync_root))?;
        anyhow::ensure!(
            root_meta.is_dir(),
            "sync folder {:?} is not a directory",
            config.sync_root
        );

        let ledger = LedgerStore::open(&config.ledger_path)
            .await
            .with_context(|| format!("failed to open ledger at {:?}", config.ledger_path))?;
        let client = StoreClient::with_endpoints(
            config.credentials.clone(),
            config.bucket.clone(),
            config.endpoints.clone(),
            config.request_timeout,
        )
        .context("failed to build storage client")?;
        let transfer = TransferClient::with_timeout(config.request_timeout)
            .context("failed to build transfer client")?;

        let options = ReconcilerOptions {
            download_domain: config.download_domain.clone(),
            download_ttl: config.download_ttl,
            claim_timeout: config.claim_timeout,
            backoff: Backoff::new(config.backoff_base, config.backoff_max, true),
        };
        let layout = SyncLayout::new(config.sync_root.clone(), config.remote_prefix.clone());
        let reconciler = Reconciler::new(client, ledger, transfer, layout, options);

        let recovered = reconciler
            .recover_interrupted_downloads()
            .await
            .context("failed to recover interrupted downloads")?;
        if recovered > 0 {
            tracing::info!(recovered, "dropped download claims from previous run");
        }

        Ok(Self { config, reconciler })
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub async fn run_once(&self) -> CycleReport {
        let report = self.reconciler.run_cycle().await;
        log_cycle(&report);
        report
    }

    /// Runs a cycle, sleeps for the poll interval, repeats.
    ///
    /// Cancellation interrupts an in-flight cycle; any claim it held is
    /// recovered on the next start.
    pub async fn run_until_cancelled(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        tracing::info!(
            sync_root = %self.config.sync_root.display(),
            bucket = %self.config.bucket,
            prefix = %self.config.remote_prefix,
            interval_secs = self.config.poll_interval.as_secs(),
            "started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.run_once() => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::info!("shutting down");
        Ok(())
    }
}

fn log_cycle(report: &CycleReport) {
    let downloaded = report.down.as_ref().map_or(0, |down| down.downloaded);
    let (uploaded, deleted) = report.up.as_ref().map_or((0, 0), |up| {
        (
            up.uploaded_new + up.uploaded_changed,
            up.gc.as_ref().map_or(0, |gc| gc.deleted_remote),
        )
    });
    if downloaded + uploaded + deleted > 0 || report.down.is_none() || report.up.is_none() {
        tracing::info!(
            downloaded,
            uploaded,
            deleted,
            down_ok = report.down.is_some(),
            up_ok = report.up.is_some(),
            "sync cycle finished"
        );
    } else {
        tracing::debug!("sync cycle finished with no changes");
    }
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
