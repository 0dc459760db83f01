//! Offline deal synchronization for storage providers.
//!
//! This crate keeps a storage node supplied with the data of its offline
//! deals: it lists pending deals from the dataset API, materializes each
//! deal's DAG as a local CAR file, and registers the file with the node.
//!
//! # Modules
//!
//! - [`api`] - Dataset API client (pending deals, content-store credentials)
//! - [`car`] - Block resolution and streaming CAR export
//! - [`ledger`] - Persistent deal ledger
//! - [`node`] - Storage node discovery and import RPC
//! - [`sync`] - Reconciler, workers and the syncer that runs them
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Dataset API   │  offlineList / dataAuth
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   Reconciler    │  merge into ledger, evict, dispatch
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ DownloadWorker  │  content store → <datadir>/car/<cid>.car
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  ImportWorker   │  Filecoin.MarketImportDealData
//! └─────────────────┘
//! ```
//!
//! The ledger is the source of truth; the queues between stages are only a
//! dispatch cache and may drop work that the next reconciliation re-offers.

pub mod api;
pub mod car;
pub mod config;
pub mod error;
pub mod ledger;
pub mod node;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use api::{ApiClient, DealList, DealSource, StoreCredentials};
pub use car::{
    BlockSource, CarExporter, GatewayBlockSource, NodeResolver, RemoteStoreConnector,
    StoreConnector,
};
pub use config::{Settings, SyncerConfig};
pub use ledger::{EvictionPolicy, Ledger};
pub use node::{DealImporter, NodeConfigDir, NodeEndpoint, NodeRpcClient};
pub use sync::{Reconciler, Syncer};
