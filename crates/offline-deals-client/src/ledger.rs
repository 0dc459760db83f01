//! Deal ledger: the authoritative map from data CID to [`DealRecord`].
//!
//! The ledger is shared by the reconciliation loop and both workers. Every
//! read-modify-write of a record happens under one lock, and records never
//! leave the ledger by reference: callers get clones.
//!
//! # Snapshot Format
//!
//! The whole map is persisted as one file, rewritten on every save:
//!
//! ```text
//! [magic "ODCLDG01" (8 bytes)]
//! [u32 little-endian length][JSON DealRecord]
//! [u32 little-endian length][JSON DealRecord]
//! ...
//! ```
//!
//! Saves go to `<path>.tmp` first and are renamed over the snapshot, so a
//! crash mid-write leaves the previous snapshot intact. Loading never fails:
//! a missing file is an empty ledger, and a damaged file yields every record
//! that decoded before the damage.

use crate::Result;
use chrono::{DateTime, Utc};
use offline_deals_core::{Deal, DealRecord, DealStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Leading bytes of every snapshot file.
const MAGIC: &[u8; 8] = b"ODCLDG01";

/// Size of a frame's length prefix.
const LEN_PREFIX: usize = 4;

/// When records leave the ledger.
#[derive(Debug, Clone, Copy)]
pub struct EvictionPolicy {
    /// Imported records older than this are evicted.
    pub clean_period: chrono::Duration,
    /// Records of any status older than this are evicted.
    pub stale_after: chrono::Duration,
}

impl EvictionPolicy {
    /// Build a policy from std durations, saturating out-of-range values.
    pub fn new(clean_period: Duration, stale_after: Duration) -> Self {
        Self {
            clean_period: chrono::Duration::from_std(clean_period)
                .unwrap_or(chrono::Duration::MAX),
            stale_after: chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Why `record` should be evicted at `now`, if at all.
    pub fn evaluate(&self, record: &DealRecord, now: DateTime<Utc>) -> Option<EvictionReason> {
        let age = record.age(now);
        if record.status == DealStatus::FinishImport && age > self.clean_period {
            Some(EvictionReason::Cleaned)
        } else if age > self.stale_after {
            Some(EvictionReason::Stale)
        } else {
            None
        }
    }
}

/// Why a record was evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Imported and past the clean period.
    Cleaned,
    /// Not refreshed within the stale window.
    Stale,
}

impl EvictionReason {
    /// Short label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            EvictionReason::Cleaned => "cleaned",
            EvictionReason::Stale => "stale",
        }
    }
}

/// A record removed by [`Ledger::sweep`].
#[derive(Debug, Clone)]
pub struct Eviction {
    /// The record as it was when evicted.
    pub record: DealRecord,
    /// Why it was evicted.
    pub reason: EvictionReason,
}

/// Result of merging a remote deal list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Deals seen for the first time.
    pub inserted: usize,
    /// Known deals whose timestamp was refreshed.
    pub refreshed: usize,
}

/// Result of sweeping the ledger.
#[derive(Debug, Clone, Default)]
pub struct Sweep {
    /// Keys of records ready to download.
    pub download: Vec<String>,
    /// Keys of records ready to import.
    pub import: Vec<String>,
    /// Records removed from the ledger.
    pub evicted: Vec<Eviction>,
}

/// The deal ledger.
///
/// Thread-safe: share it via `Arc<Ledger>`.
pub struct Ledger {
    path: PathBuf,
    records: Mutex<HashMap<String, DealRecord>>,
    /// Serializes snapshot writes so an older snapshot never lands last.
    save_lock: Mutex<()>,
}

impl Ledger {
    /// Load the ledger from its snapshot file.
    ///
    /// A missing file starts an empty ledger. Read or decode problems are
    /// logged and the ledger keeps whatever decoded cleanly.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();

        let records = match std::fs::read(&path) {
            Ok(bytes) => {
                let (records, problem) = decode_snapshot(&bytes);
                if let Some(problem) = problem {
                    error!(
                        "load cache deals failed: {}; continuing with {} records",
                        problem,
                        records.len()
                    );
                }
                records
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                error!("read ledger snapshot {} failed: {}", path.display(), e);
                HashMap::new()
            }
        };

        info!("Loaded {} deals from {}", records.len(), path.display());
        offline_deals_core::metrics::set_gauge("ledger_records", records.len() as f64);

        Self {
            path,
            records: Mutex::new(records),
            save_lock: Mutex::new(()),
        }
    }

    /// Snapshot file this ledger persists to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Roll every in-flight status back to where its work started.
    ///
    /// Applied once right after [`Ledger::load`]. Returns the number of
    /// records that changed.
    pub fn reset_incomplete_status(&self) -> usize {
        let mut records = self.records.lock();
        let mut reset = 0usize;
        for record in records.values_mut() {
            let before = record.status;
            if record.reset_incomplete() {
                debug!(cid = %record.key(), "reset {} -> {}", before, record.status);
                reset += 1;
            }
        }
        if reset > 0 {
            info!("Reset {} in-flight deals after restart", reset);
        }
        reset
    }

    /// Write the full ledger to the snapshot file.
    pub fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock();
        let records = self.snapshot();
        let bytes = encode_snapshot(&records)?;

        let tmp = tmp_path(&self.path);
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        debug!("Saved {} deals to {}", records.len(), self.path.display());
        offline_deals_core::metrics::set_gauge("ledger_records", records.len() as f64);
        Ok(())
    }

    /// [`Ledger::save`], logging instead of returning failures.
    ///
    /// The next save supersedes a failed one.
    pub fn save_or_log(&self) {
        if let Err(e) = self.save() {
            error!("save cache deals failed: {}", e);
            offline_deals_core::metrics::increment("ledger_save_errors_total", 1);
        }
    }

    /// [`Ledger::save_or_log`] on the blocking thread pool.
    pub async fn persist(self: &Arc<Self>) {
        let ledger = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || ledger.save_or_log()).await {
            error!("save cache deals task failed: {}", e);
        }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the ledger holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// A copy of the record keyed `key`.
    pub fn get(&self, key: &str) -> Option<DealRecord> {
        self.records.lock().get(key).cloned()
    }

    /// Copies of all records, ordered by key.
    pub fn snapshot(&self) -> Vec<DealRecord> {
        let records = self.records.lock();
        let mut out: Vec<DealRecord> = records.values().cloned().collect();
        out.sort_by_key(|r| r.key());
        out
    }

    /// Insert or replace a record under its own key.
    pub fn insert(&self, record: DealRecord) -> Option<DealRecord> {
        self.records.lock().insert(record.key(), record)
    }

    /// Merge a remote deal list.
    ///
    /// Known deals only get their timestamp refreshed; their status is left
    /// alone. Unknown deals are inserted as `ReadyDownload`.
    pub fn merge(&self, deals: &[Deal], now: DateTime<Utc>) -> MergeStats {
        let mut records = self.records.lock();
        let mut stats = MergeStats::default();
        for deal in deals {
            match records.get_mut(&deal.key()) {
                Some(record) => {
                    record.updated = now;
                    stats.refreshed += 1;
                }
                None => {
                    debug!(cid = %deal.data_cid, miner = %deal.miner, "new offline deal");
                    records.insert(deal.key(), DealRecord::new(deal.clone(), now));
                    stats.inserted += 1;
                }
            }
        }
        stats
    }

    /// Evict what `policy` says must go and collect the keys ready for work.
    pub fn sweep(&self, now: DateTime<Utc>, policy: &EvictionPolicy) -> Sweep {
        let mut records = self.records.lock();
        let mut sweep = Sweep::default();

        let mut keys: Vec<String> = records.keys().cloned().collect();
        keys.sort();

        for key in keys {
            let Some(record) = records.get(&key) else {
                continue;
            };
            if let Some(reason) = policy.evaluate(record, now) {
                if let Some(record) = records.remove(&key) {
                    sweep.evicted.push(Eviction { record, reason });
                }
                continue;
            }
            match record.status {
                DealStatus::ReadyDownload => sweep.download.push(key),
                DealStatus::FinishDownload => sweep.import.push(key),
                _ => {}
            }
        }

        sweep
    }

    /// Atomically run `f` against the record keyed `key`.
    ///
    /// Returns `None` if there is no such record.
    pub fn update<T, F>(&self, key: &str, f: F) -> Option<T>
    where
        F: FnOnce(&mut DealRecord) -> T,
    {
        let mut records = self.records.lock();
        records.get_mut(key).map(f)
    }

    /// Move the record keyed `key` from `from` to `to`.
    ///
    /// Returns the updated record, or `None` if the record is gone or no
    /// longer in `from`. Used by workers to take ownership of queued work.
    pub fn claim(
        &self,
        key: &str,
        from: DealStatus,
        to: DealStatus,
        now: DateTime<Utc>,
    ) -> Option<DealRecord> {
        self.update(key, |record| {
            if record.status != from {
                return None;
            }
            record.transition(to, now).ok()?;
            Some(record.clone())
        })
        .flatten()
    }

    /// Move the record keyed `key` to `to`.
    ///
    /// Returns `Ok(None)` if the record is gone, and an error if `to` is not
    /// reachable from the record's current status.
    pub fn transition(
        &self,
        key: &str,
        to: DealStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<DealRecord>> {
        self.update(key, |record| {
            record.transition(to, now)?;
            Ok(record.clone())
        })
        .transpose()
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Encode records into the snapshot format.
fn encode_snapshot(records: &[DealRecord]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(MAGIC.len() + records.len() * 512);
    out.extend_from_slice(MAGIC);
    for record in records {
        let body = serde_json::to_vec(record)?;
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
    }
    Ok(out)
}

/// Decode a snapshot, returning every record read before the first problem.
///
/// An empty input, or input ending exactly on a frame boundary, is a clean
/// end of stream and reports no problem.
fn decode_snapshot(bytes: &[u8]) -> (HashMap<String, DealRecord>, Option<String>) {
    let mut records = HashMap::new();
    if bytes.is_empty() {
        return (records, None);
    }
    let Some(mut rest) = bytes.strip_prefix(MAGIC.as_slice()) else {
        return (records, Some("unrecognized snapshot header".to_string()));
    };

    while !rest.is_empty() {
        if rest.len() < LEN_PREFIX {
            return (records, Some("truncated frame length".to_string()));
        }
        let (prefix, tail) = rest.split_at(LEN_PREFIX);
        let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if tail.len() < len {
            return (
                records,
                Some(format!(
                    "truncated frame: need {} bytes, have {}",
                    len,
                    tail.len()
                )),
            );
        }
        let (body, tail) = tail.split_at(len);
        match serde_json::from_slice::<DealRecord>(body) {
            Ok(record) => {
                records.insert(record.key(), record);
            }
            Err(e) => return (records, Some(format!("bad record: {e}"))),
        }
        rest = tail;
    }

    (records, None)
}
