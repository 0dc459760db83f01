//! Download and import workers.
//!
//! Each worker is the only consumer of its queue, so at most one download
//! and one import run at any time. A worker takes ownership of a queued key
//! by atomically moving its record into the in-flight status; keys whose
//! record has moved on since they were queued are skipped.
//!
//! Failures roll the record back one step and re-offer the key. If the
//! queue is full the record simply waits for the next reconciliation sweep.
//! The ledger is saved after every attempt.

use super::queue::{DispatchQueue, QueueReceiver};
use crate::car::{CarExporter, NodeResolver, StoreConnector};
use crate::ledger::Ledger;
use crate::node::DealImporter;
use crate::{Error, Result};
use chrono::Utc;
use metrics::{counter, histogram};
use offline_deals_core::{DealRecord, DealStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

/// Size of the file at `path`, or 0 if it cannot be read.
async fn file_size(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0)
}

// =============================================================================
// Download
// =============================================================================

/// Materializes deals' data as local CAR files.
pub struct DownloadWorker {
    ledger: Arc<Ledger>,
    connector: Arc<dyn StoreConnector>,
    downloads: DispatchQueue,
    imports: DispatchQueue,
    car_dir: PathBuf,
    window: usize,
}

impl DownloadWorker {
    pub fn new(
        ledger: Arc<Ledger>,
        connector: Arc<dyn StoreConnector>,
        downloads: DispatchQueue,
        imports: DispatchQueue,
        car_dir: PathBuf,
        window: usize,
    ) -> Self {
        Self {
            ledger,
            connector,
            downloads,
            imports,
            car_dir,
            window,
        }
    }

    /// Consume the download queue until cancelled.
    pub async fn run(self, mut queue: QueueReceiver, cancel: CancellationToken) {
        tracing::info!("Download worker started");
        loop {
            let key = tokio::select! {
                _ = cancel.cancelled() => break,
                key = queue.recv() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            // Failures are logged and rolled back inside.
            let _ = self.process(&key, &cancel).await;
        }
        queue.close();
        tracing::info!("Download worker stopped");
    }

    /// Download the deal keyed `key` if it is still ready.
    pub async fn process(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        let Some(record) = self.ledger.claim(
            key,
            DealStatus::ReadyDownload,
            DealStatus::StartDownload,
            Utc::now(),
        ) else {
            tracing::debug!(cid = %key, "skip download: no longer ready");
            return Ok(());
        };

        counter!("download_attempts_total").increment(1);
        let path = record.car_path(&self.car_dir);
        let result = self.download(&record, &path, cancel).await;

        match &result {
            Ok(size) => {
                let updated = self.ledger.update(key, |r| {
                    r.transition(DealStatus::FinishDownload, Utc::now())?;
                    r.data_size = *size;
                    Ok::<_, offline_deals_core::Error>(())
                });
                match updated {
                    Some(Ok(())) => {
                        self.imports.offer(key);
                    }
                    Some(Err(e)) => tracing::error!(cid = %key, "record download failed: {}", e),
                    None => {
                        tracing::warn!(cid = %key, "deal evicted during download");
                        let _ = tokio::fs::remove_file(&path).await;
                    }
                }
            }
            Err(e) => {
                tracing::error!(cid = %key, "download failed: {}", e);
                counter!("download_failures_total").increment(1);
                let _ = tokio::fs::remove_file(&path).await;
                let rolled_back = self.ledger.update(key, |r| {
                    r.data_size = 0;
                    r.transition(DealStatus::ReadyDownload, Utc::now())
                });
                if let Some(Err(e)) = rolled_back {
                    tracing::error!(cid = %key, "roll back download failed: {}", e);
                }
                if !cancel.is_cancelled() {
                    self.downloads.offer(key);
                }
            }
        }

        self.ledger.persist().await;
        result.map(|_| ())
    }

    /// Produce the archive, returning its size on disk.
    async fn download(
        &self,
        record: &DealRecord,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if record.data_size > 0 && file_size(path).await == record.data_size {
            tracing::info!(cid = %record.key(), "car file already exists, skip download");
            counter!("download_reused_total").increment(1);
            return Ok(record.data_size);
        }

        let source = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            source = self.connector.connect() => source?,
        };

        let start = Instant::now();
        let file = tokio::fs::File::create(path).await.inspect_err(|e| {
            tracing::error!(cid = %record.key(), "create car file error: {}", e)
        })?;
        let mut writer = BufWriter::new(file);
        let exporter = CarExporter::new(NodeResolver::new(source), self.window);
        let written = exporter
            .export(record.deal.data_cid, &mut writer, cancel)
            .await
            .inspect_err(|e| {
                tracing::error!(cid = %record.key(), "generate car file error: {}", e)
            })?;
        writer.get_mut().sync_all().await?;
        drop(writer);

        let elapsed = start.elapsed();
        tracing::info!(cid = %record.key(), "generate car file cost {:?}", elapsed);
        counter!("download_bytes_total").increment(written);
        histogram!("download_duration_seconds").record(elapsed.as_secs_f64());

        Ok(file_size(path).await)
    }
}

// =============================================================================
// Import
// =============================================================================

/// Registers downloaded archives with the storage node.
pub struct ImportWorker {
    ledger: Arc<Ledger>,
    importer: Arc<dyn DealImporter>,
    downloads: DispatchQueue,
    imports: DispatchQueue,
    car_dir: PathBuf,
}

impl ImportWorker {
    pub fn new(
        ledger: Arc<Ledger>,
        importer: Arc<dyn DealImporter>,
        downloads: DispatchQueue,
        imports: DispatchQueue,
        car_dir: PathBuf,
    ) -> Self {
        Self {
            ledger,
            importer,
            downloads,
            imports,
            car_dir,
        }
    }

    /// Consume the import queue until cancelled.
    ///
    /// A fatal error cancels `cancel` so the whole syncer stops, and is
    /// returned.
    pub async fn run(self, mut queue: QueueReceiver, cancel: CancellationToken) -> Result<()> {
        tracing::info!("Import worker started");
        let mut outcome = Ok(());
        loop {
            let key = tokio::select! {
                _ = cancel.cancelled() => break,
                key = queue.recv() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            if let Err(e) = self.process(&key, &cancel).await
                && e.is_fatal()
            {
                tracing::error!("import worker cannot continue: {}", e);
                cancel.cancel();
                outcome = Err(e);
                break;
            }
        }
        queue.close();
        tracing::info!("Import worker stopped");
        outcome
    }

    /// Import the deal keyed `key` if its archive is ready.
    pub async fn process(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        let Some(record) = self.ledger.get(key) else {
            tracing::debug!(cid = %key, "skip import: deal evicted");
            return Ok(());
        };
        if record.status != DealStatus::FinishDownload {
            tracing::debug!(cid = %key, status = %record.status, "skip import: not downloaded");
            return Ok(());
        }

        let path = std::path::absolute(record.car_path(&self.car_dir))?;
        let size = file_size(&path).await;
        if size != record.data_size {
            return self.reject(key, record.data_size, size).await;
        }

        let Some(record) = self.ledger.claim(
            key,
            DealStatus::FinishDownload,
            DealStatus::StartImport,
            Utc::now(),
        ) else {
            return Ok(());
        };

        counter!("import_attempts_total").increment(1);
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.importer.import(&record.deal.prop_cid, &path) => result,
        };

        let next = match &result {
            Ok(()) => {
                tracing::info!(cid = %key, "import deal data success");
                DealStatus::FinishImport
            }
            Err(e) => {
                tracing::error!(cid = %key, "import deal data failed: {}", e);
                counter!("import_failures_total").increment(1);
                DealStatus::FinishDownload
            }
        };
        if let Err(e) = self.ledger.transition(key, next, Utc::now()) {
            tracing::error!(cid = %key, "record import result failed: {}", e);
        }
        if result.is_err() && !cancel.is_cancelled() {
            self.imports.offer(key);
        }

        self.ledger.persist().await;
        result
    }

    /// Send a deal whose archive no longer matches its recorded size back to
    /// download.
    async fn reject(&self, key: &str, expected: u64, actual: u64) -> Result<()> {
        tracing::warn!(
            cid = %key,
            "verify data size failed: expected {} bytes, found {}",
            expected,
            actual
        );
        counter!("import_verification_failures_total").increment(1);

        let rolled_back = self
            .ledger
            .update(key, |r| {
                if r.status != DealStatus::FinishDownload {
                    return false;
                }
                r.data_size = 0;
                r.transition(DealStatus::ReadyDownload, Utc::now()).is_ok()
            })
            .unwrap_or(false);
        if rolled_back {
            self.downloads.offer(key);
        }

        self.ledger.persist().await;
        Err(Error::Verification { expected, actual })
    }
}
