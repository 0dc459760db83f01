//! Deal model and lifecycle.
//!
//! A [`Deal`] arrives from the dataset API and never changes. The client wraps
//! it in a [`DealRecord`] that tracks where the deal's data is in the local
//! pipeline:
//!
//! ```text
//! ReadyDownload ──▶ StartDownload ──▶ FinishDownload ──▶ StartImport ──▶ FinishImport
//!       ▲                 │               ▲   │                │
//!       └──── failed ─────┘               │   │                │
//!       ▲                                 └───┼──── failed ────┘
//!       └────────── size check failed ────────┘
//! ```
//!
//! `StartDownload` and `StartImport` mark work in flight. They are never
//! resumed after a restart; [`DealStatus::stable`] maps them back to the state
//! the work started from.

use crate::{Error, Result, cid_json};
use chrono::{DateTime, Duration, Utc};
use cid::Cid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// File extension of a deal's local archive.
pub const CAR_EXTENSION: &str = "car";

/// An offline deal as published by the dataset API.
///
/// Field names follow the API's JSON (`Miner`, `DataCid`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Deal {
    /// Storage provider address (e.g. `f01000`).
    #[serde(default)]
    pub miner: String,
    /// Client wallet address.
    #[serde(default)]
    pub client: String,
    /// Root of the deal's data DAG.
    #[serde(with = "cid_json")]
    pub data_cid: Cid,
    /// Whether the deal uses verified datacap.
    #[serde(default)]
    pub verified: bool,
    /// Proposal CID the storage node knows the deal by.
    #[serde(with = "cid_json")]
    pub prop_cid: Cid,
    /// Padded piece size in bytes.
    #[serde(default)]
    pub piece_size: u64,
    /// Piece commitment.
    #[serde(default, with = "cid_json::option")]
    pub piece_cid: Option<Cid>,
}

impl Deal {
    /// Ledger key: the canonical string form of the data CID.
    pub fn key(&self) -> String {
        self.data_cid.to_string()
    }
}

/// Where a deal's data is in the local pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DealStatus {
    /// Waiting to be downloaded.
    ReadyDownload,
    /// Download in flight.
    StartDownload,
    /// Archive written locally, waiting to be imported.
    FinishDownload,
    /// Import in flight.
    StartImport,
    /// Imported into the storage node.
    FinishImport,
}

impl DealStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [DealStatus; 5] = [
        DealStatus::ReadyDownload,
        DealStatus::StartDownload,
        DealStatus::FinishDownload,
        DealStatus::StartImport,
        DealStatus::FinishImport,
    ];

    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: DealStatus) -> bool {
        use DealStatus::*;
        matches!(
            (self, next),
            (ReadyDownload, StartDownload)
                | (StartDownload, FinishDownload)
                | (StartDownload, ReadyDownload)
                | (FinishDownload, StartImport)
                | (FinishDownload, ReadyDownload)
                | (StartImport, FinishImport)
                | (StartImport, FinishDownload)
        )
    }

    /// Whether this status marks work in flight.
    pub fn is_transient(self) -> bool {
        matches!(self, DealStatus::StartDownload | DealStatus::StartImport)
    }

    /// The status to resume from after a restart.
    pub fn stable(self) -> DealStatus {
        match self {
            DealStatus::StartDownload => DealStatus::ReadyDownload,
            DealStatus::StartImport => DealStatus::FinishDownload,
            other => other,
        }
    }

    /// Short label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            DealStatus::ReadyDownload => "ready_download",
            DealStatus::StartDownload => "start_download",
            DealStatus::FinishDownload => "finish_download",
            DealStatus::StartImport => "start_import",
            DealStatus::FinishImport => "finish_import",
        }
    }
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deal plus its local progress. Owned by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealRecord {
    /// The deal as last seen from the API.
    pub deal: Deal,
    /// Last time the record was seen remotely or changed locally.
    pub updated: DateTime<Utc>,
    /// Lifecycle status.
    pub status: DealStatus,
    /// Size of the downloaded archive in bytes (0 until a download finishes).
    pub data_size: u64,
}

impl DealRecord {
    /// A freshly discovered deal, ready to download.
    pub fn new(deal: Deal, now: DateTime<Utc>) -> Self {
        Self {
            deal,
            updated: now,
            status: DealStatus::ReadyDownload,
            data_size: 0,
        }
    }

    /// Ledger key: the canonical string form of the data CID.
    pub fn key(&self) -> String {
        self.deal.key()
    }

    /// Time since the record was last updated.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.updated)
    }

    /// Move to `next`, refusing anything that is not a lifecycle edge.
    pub fn transition(&mut self, next: DealStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated = now;
        Ok(())
    }

    /// Roll a transient status back to where its work started.
    ///
    /// Returns `true` if the status changed.
    pub fn reset_incomplete(&mut self) -> bool {
        if !self.status.is_transient() {
            return false;
        }
        self.status = self.status.stable();
        true
    }

    /// Path of this deal's archive inside `car_dir`.
    pub fn car_path(&self, car_dir: &Path) -> PathBuf {
        car_path(car_dir, &self.key())
    }
}

/// Path of the archive for the deal keyed `key` inside `car_dir`.
pub fn car_path(car_dir: &Path, key: &str) -> PathBuf {
    car_dir.join(format!("{key}.{CAR_EXTENSION}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid_json::parse_cid;

    fn sample_deal() -> Deal {
        Deal {
            miner: "f01000".to_string(),
            client: "f1abcdefg".to_string(),
            data_cid: parse_cid("QmYnsC47dUxaWFeoo3bvtoARw79TtdFgAn3UDkQKo1J1NF").unwrap(),
            verified: true,
            prop_cid: parse_cid("bafyreibf2znjlonzbpn6pwbhvugiauto2g37zv4pb4wargpoedeglo44zq")
                .unwrap(),
            piece_size: 8_388_608,
            piece_cid: None,
        }
    }

    // =========================================================================
    // Transition graph
    // =========================================================================

    #[test]
    fn test_forward_chain_is_legal() {
        for pair in DealStatus::ALL.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn test_rollback_edges_are_legal() {
        use DealStatus::*;
        assert!(StartDownload.can_transition_to(ReadyDownload));
        assert!(StartImport.can_transition_to(FinishDownload));
        assert!(FinishDownload.can_transition_to(ReadyDownload));
    }

    #[test]
    fn test_skips_and_stray_edges_are_illegal() {
        use DealStatus::*;
        assert!(!ReadyDownload.can_transition_to(FinishDownload));
        assert!(!ReadyDownload.can_transition_to(FinishImport));
        assert!(!StartDownload.can_transition_to(StartImport));
        assert!(!FinishImport.can_transition_to(ReadyDownload));
        assert!(!StartImport.can_transition_to(ReadyDownload));
        for status in DealStatus::ALL {
            assert!(!status.can_transition_to(status));
        }
    }

    #[test]
    fn test_stable_status() {
        use DealStatus::*;
        assert_eq!(StartDownload.stable(), ReadyDownload);
        assert_eq!(StartImport.stable(), FinishDownload);
        assert_eq!(FinishImport.stable(), FinishImport);
        assert!(StartDownload.is_transient());
        assert!(!FinishDownload.is_transient());
    }

    // =========================================================================
    // Records
    // =========================================================================

    #[test]
    fn test_record_transition_updates_timestamp() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(5);
        let mut record = DealRecord::new(sample_deal(), t0);
        record.transition(DealStatus::StartDownload, t1).unwrap();
        assert_eq!(record.status, DealStatus::StartDownload);
        assert_eq!(record.updated, t1);
    }

    #[test]
    fn test_record_rejects_illegal_transition() {
        let now = Utc::now();
        let mut record = DealRecord::new(sample_deal(), now);
        let err = record.transition(DealStatus::FinishImport, now).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(record.status, DealStatus::ReadyDownload);
    }

    #[test]
    fn test_reset_incomplete_is_idempotent() {
        let now = Utc::now();
        let mut record = DealRecord::new(sample_deal(), now);
        record.status = DealStatus::StartImport;
        assert!(record.reset_incomplete());
        assert_eq!(record.status, DealStatus::FinishDownload);
        assert!(!record.reset_incomplete());
        assert_eq!(record.status, DealStatus::FinishDownload);
    }

    #[test]
    fn test_car_path_uses_key() {
        let record = DealRecord::new(sample_deal(), Utc::now());
        let path = record.car_path(Path::new("/data/car"));
        assert_eq!(
            path,
            PathBuf::from("/data/car/QmYnsC47dUxaWFeoo3bvtoARw79TtdFgAn3UDkQKo1J1NF.car")
        );
    }

    // =========================================================================
    // JSON
    // =========================================================================

    #[test]
    fn test_deal_decodes_api_json() {
        let json = r#"{
            "Miner": "f01000",
            "Client": "f1abcdefg",
            "DataCid": {"/": "QmYnsC47dUxaWFeoo3bvtoARw79TtdFgAn3UDkQKo1J1NF"},
            "Verified": false,
            "PropCid": {"/": "bafyreibf2znjlonzbpn6pwbhvugiauto2g37zv4pb4wargpoedeglo44zq"},
            "PieceSize": 8388608,
            "PieceCid": null
        }"#;
        let deal: Deal = serde_json::from_str(json).unwrap();
        assert_eq!(deal.miner, "f01000");
        assert_eq!(deal.key(), "QmYnsC47dUxaWFeoo3bvtoARw79TtdFgAn3UDkQKo1J1NF");
        assert_eq!(deal.piece_size, 8_388_608);
        assert!(deal.piece_cid.is_none());
    }

    #[test]
    fn test_record_json_round_trip() {
        let record = DealRecord::new(sample_deal(), Utc::now());
        let bytes = serde_json::to_vec(&record).unwrap();
        let back: DealRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, record);
    }
}
