//! Periodic reconciliation of the ledger against the remote deal list.
//!
//! One cycle:
//!
//! 1. Fetch the pending-deal list. A failure ends the cycle untouched.
//! 2. Merge it into the ledger (refresh known deals, insert new ones).
//! 3. Sweep: evict expired records, offer ready ones to the queues.
//! 4. Save the ledger.
//!
//! Every ready record is offered on every cycle whether or not an earlier
//! offer succeeded, which is what makes dropped offers harmless.

use super::queue::{DispatchQueue, Offer};
use crate::Result;
use crate::api::DealSource;
use crate::ledger::{EvictionPolicy, Ledger};
use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use offline_deals_core::DealStatus;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What one reconciliation cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Deals in the remote list.
    pub remote: usize,
    /// Deals inserted into the ledger.
    pub inserted: usize,
    /// Keys newly queued for download.
    pub queued_download: usize,
    /// Keys newly queued for import.
    pub queued_import: usize,
    /// Offers dropped because a queue was full.
    pub dropped: usize,
    /// Records evicted.
    pub evicted: usize,
}

/// Runs reconciliation cycles.
pub struct Reconciler {
    ledger: Arc<Ledger>,
    source: Arc<dyn DealSource>,
    downloads: DispatchQueue,
    imports: DispatchQueue,
    policy: EvictionPolicy,
    car_dir: PathBuf,
    auto_clean: bool,
    interval: Duration,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<Ledger>,
        source: Arc<dyn DealSource>,
        downloads: DispatchQueue,
        imports: DispatchQueue,
        policy: EvictionPolicy,
        car_dir: PathBuf,
        auto_clean: bool,
        interval: Duration,
    ) -> Self {
        Self {
            ledger,
            source,
            downloads,
            imports,
            policy,
            car_dir,
            auto_clean,
            interval,
        }
    }

    /// Run one cycle as of `now`.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let start = Instant::now();

        let deals = match self.source.pending_deals().await {
            Ok(deals) => deals,
            Err(e) => {
                tracing::error!("getOfflineDeals failed, {}", e);
                counter!("sync_cycle_errors_total").increment(1);
                return Err(e);
            }
        };

        let mut report = CycleReport {
            remote: deals.len(),
            ..Default::default()
        };
        gauge!("sync_remote_deals").set(deals.len() as f64);

        let merged = self.ledger.merge(&deals, now);
        report.inserted = merged.inserted;
        counter!("sync_deals_inserted_total").increment(merged.inserted as u64);

        let sweep = self.ledger.sweep(now, &self.policy);

        for key in &sweep.download {
            match self.downloads.offer(key) {
                Offer::Queued => report.queued_download += 1,
                Offer::Full => report.dropped += 1,
                Offer::AlreadyQueued | Offer::Closed => {}
            }
        }
        for key in &sweep.import {
            match self.imports.offer(key) {
                Offer::Queued => report.queued_import += 1,
                Offer::Full => report.dropped += 1,
                Offer::AlreadyQueued | Offer::Closed => {}
            }
        }

        report.evicted = sweep.evicted.len();
        for eviction in &sweep.evicted {
            let key = eviction.record.key();
            tracing::info!(
                cid = %key,
                status = %eviction.record.status,
                "evicted deal ({})",
                eviction.reason.as_str()
            );
            counter!("sync_deals_evicted_total", "reason" => eviction.reason.as_str())
                .increment(1);

            if self.auto_clean && eviction.record.status == DealStatus::FinishImport {
                let path = eviction.record.car_path(&self.car_dir);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => tracing::debug!(cid = %key, "removed {}", path.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!(cid = %key, "remove {} failed: {}", path.display(), e),
                }
            }
        }

        self.ledger.persist().await;

        let elapsed = start.elapsed();
        counter!("sync_cycles_total").increment(1);
        histogram!("sync_cycle_duration_seconds").record(elapsed.as_secs_f64());
        tracing::info!(
            "Reconciled {} remote deals: {} new, {} queued for download, {} queued for import, {} dropped, {} evicted in {:?}",
            report.remote,
            report.inserted,
            report.queued_download,
            report.queued_import,
            report.dropped,
            report.evicted,
            elapsed
        );

        Ok(report)
    }

    /// Run a cycle now and then every interval until `cancel` fires.
    pub async fn run_periodic(&self, cancel: CancellationToken) {
        tracing::info!(
            "Starting reconciliation (interval: {}s)",
            self.interval.as_secs()
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                // Failures are logged inside; the next tick retries from scratch.
                _ = self.run_cycle(Utc::now()) => {}
            }
        }

        tracing::info!("Reconciliation stopped");
    }
}
