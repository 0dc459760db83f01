//! The syncer: owns the ledger and runs the reconciler and both workers.

use super::queue::dispatch_queue;
use super::reconcile::Reconciler;
use super::worker::{DownloadWorker, ImportWorker};
use crate::api::DealSource;
use crate::car::StoreConnector;
use crate::config::SyncerConfig;
use crate::ledger::{EvictionPolicy, Ledger};
use crate::node::DealImporter;
use crate::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Offline deal syncer.
pub struct Syncer {
    config: SyncerConfig,
    ledger: Arc<Ledger>,
    source: Arc<dyn DealSource>,
    connector: Arc<dyn StoreConnector>,
    importer: Arc<dyn DealImporter>,
}

impl Syncer {
    /// Load the ledger and roll back work that was in flight when the
    /// process last stopped.
    pub fn new(
        config: SyncerConfig,
        source: Arc<dyn DealSource>,
        connector: Arc<dyn StoreConnector>,
        importer: Arc<dyn DealImporter>,
    ) -> Self {
        let ledger = Arc::new(Ledger::load(&config.ledger_path));
        if ledger.reset_incomplete_status() > 0 {
            ledger.save_or_log();
        }
        Self {
            config,
            ledger,
            source,
            connector,
            importer,
        }
    }

    /// The shared ledger.
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Run until `cancel` fires, then save the ledger one last time.
    ///
    /// Returns the fatal error that stopped the syncer, if any.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.car_dir).await?;

        let (downloads, download_rx) = dispatch_queue("download", self.config.queue_capacity);
        let (imports, import_rx) = dispatch_queue("import", self.config.queue_capacity);

        let download_worker = DownloadWorker::new(
            self.ledger.clone(),
            self.connector.clone(),
            downloads.clone(),
            imports.clone(),
            self.config.car_dir.clone(),
            self.config.export_window,
        );
        let import_worker = ImportWorker::new(
            self.ledger.clone(),
            self.importer.clone(),
            downloads.clone(),
            imports.clone(),
            self.config.car_dir.clone(),
        );
        let reconciler = Reconciler::new(
            self.ledger.clone(),
            self.source.clone(),
            downloads,
            imports,
            EvictionPolicy::new(self.config.clean_period, self.config.stale_after),
            self.config.car_dir.clone(),
            self.config.auto_clean,
            self.config.reconcile_interval,
        );

        let download_task = tokio::spawn(download_worker.run(download_rx, cancel.clone()));
        let import_task = tokio::spawn(import_worker.run(import_rx, cancel.clone()));
        let reconcile_task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { reconciler.run_periodic(cancel).await })
        };
        tracing::info!(
            "Syncer started with {} deals in the ledger",
            self.ledger.len()
        );

        cancel.cancelled().await;
        tracing::info!("Stopping syncer");

        let mut outcome = Ok(());
        if let Err(e) = download_task.await {
            tracing::error!("download worker panicked: {}", e);
        }
        match import_task.await {
            Ok(Err(e)) => outcome = Err(e),
            Ok(Ok(())) => {}
            Err(e) => tracing::error!("import worker panicked: {}", e),
        }
        if let Err(e) = reconcile_task.await {
            tracing::error!("reconciler panicked: {}", e);
        }

        self.ledger.persist().await;
        tracing::info!("Syncer stopped with {} deals saved", self.ledger.len());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        DagBuilder, MemoryStoreConnector, RecordingImporter, ScriptedDealSource, deal_for,
        read_car,
    };
    use chrono::{Duration as ChronoDuration, Utc};
    use offline_deals_core::{DealRecord, DealStatus};
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir) -> SyncerConfig {
        SyncerConfig {
            auto_clean: true,
            clean_period: Duration::from_secs(3600),
            reconcile_interval: Duration::from_millis(50),
            queue_capacity: 4,
            export_window: 2,
            ..SyncerConfig::with_defaults(tmp.path())
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[test]
    fn test_new_resets_in_flight_records() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        {
            let ledger = Ledger::load(&config.ledger_path);
            let mut record = DealRecord::new(crate::testing::deal(1), Utc::now());
            record.status = DealStatus::StartDownload;
            ledger.insert(record);
            ledger.save().unwrap();
        }

        let syncer = Syncer::new(
            config.clone(),
            Arc::new(ScriptedDealSource::default()),
            Arc::new(MemoryStoreConnector::new(Default::default())),
            Arc::new(RecordingImporter::default()),
        );
        let key = crate::testing::deal(1).key();
        assert_eq!(
            syncer.ledger().get(&key).unwrap().status,
            DealStatus::ReadyDownload
        );
        // The reset is persisted before any work starts.
        assert_eq!(
            Ledger::load(&config.ledger_path).get(&key).unwrap().status,
            DealStatus::ReadyDownload
        );
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);

        // 3 nodes, 8 KiB of leaf data.
        let mut dag = DagBuilder::new();
        let a = dag.raw(&[0x11; 4096]);
        let b = dag.raw(&[0x22; 4096]);
        let root = dag.pb(&[a, b], b"");
        let deal = deal_for(root, 7);
        let key = deal.key();

        let source = Arc::new(ScriptedDealSource::new(vec![deal.clone()]));
        let importer = Arc::new(RecordingImporter::default());
        let syncer = Syncer::new(
            config.clone(),
            source.clone(),
            Arc::new(MemoryStoreConnector::new(dag.into_source())),
            importer.clone(),
        );
        let ledger = syncer.ledger().clone();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(syncer.run(cancel.clone()));

        let imported = wait_for(|| {
            ledger
                .get(&key)
                .is_some_and(|r| r.status == DealStatus::FinishImport)
        })
        .await;
        assert!(imported, "deal never reached FinishImport");

        cancel.cancel();
        task.await.unwrap().unwrap();

        // The archive is a complete CAR of the deal's DAG.
        let record = ledger.get(&key).unwrap();
        let path = record.car_path(&config.car_dir);
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(record.data_size, bytes.len() as u64);
        let (roots, blocks) = read_car(&bytes);
        assert_eq!(roots, vec![root]);
        assert_eq!(blocks.len(), 3);

        assert_eq!(importer.calls().len(), 1);
        assert_eq!(importer.calls()[0].0, deal.prop_cid);

        // Final save persisted the imported state.
        let saved = Ledger::load(&config.ledger_path);
        assert_eq!(saved.get(&key).unwrap().status, DealStatus::FinishImport);

        // Once the clean period has passed, the record and its archive go.
        source.set_deals(Vec::new());
        let (downloads, _download_rx) = dispatch_queue("download", 4);
        let (imports, _import_rx) = dispatch_queue("import", 4);
        let reconciler = Reconciler::new(
            Arc::new(saved),
            source,
            downloads,
            imports,
            EvictionPolicy::new(config.clean_period, config.stale_after),
            config.car_dir.clone(),
            config.auto_clean,
            config.reconcile_interval,
        );
        let later = Utc::now() + ChronoDuration::hours(1) + ChronoDuration::seconds(1);
        let report = reconciler.run_cycle(later).await.unwrap();
        assert_eq!(report.evicted, 1);
        assert!(!path.exists());
        assert!(Ledger::load(&config.ledger_path).is_empty());
    }

    #[tokio::test]
    async fn test_fatal_import_error_stops_syncer() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);

        let mut dag = DagBuilder::new();
        let root = dag.raw(b"tiny deal");
        let deal = deal_for(root, 3);

        let importer = Arc::new(RecordingImporter::default());
        importer.fail_fatally();
        let syncer = Syncer::new(
            config.clone(),
            Arc::new(ScriptedDealSource::new(vec![deal.clone()])),
            Arc::new(MemoryStoreConnector::new(dag.into_source())),
            importer,
        );
        let ledger = syncer.ledger().clone();

        let cancel = CancellationToken::new();
        let result = tokio::time::timeout(Duration::from_secs(10), syncer.run(cancel.clone()))
            .await
            .expect("syncer did not stop");

        let err = result.unwrap_err();
        assert!(err.is_fatal());
        assert!(cancel.is_cancelled());
        assert_eq!(
            ledger.get(&deal.key()).unwrap().status,
            DealStatus::FinishDownload
        );
    }

    #[tokio::test]
    async fn test_api_outage_does_not_stop_syncer() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let source = Arc::new(ScriptedDealSource::default());
        source.fail();

        let syncer = Syncer::new(
            config,
            source.clone(),
            Arc::new(MemoryStoreConnector::new(Default::default())),
            Arc::new(RecordingImporter::default()),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(syncer.run(cancel.clone()));

        // Several failed cycles, still running.
        assert!(wait_for(|| source.calls() >= 3).await);
        assert!(!task.is_finished());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
