//! Deal synchronization engine.
//!
//! ```text
//!                 ┌──────────────────────┐
//!                 │      Reconciler      │  every 5 minutes:
//!                 │ fetch → merge → sweep│  fetch, merge, evict, dispatch, save
//!                 └───┬──────────────┬───┘
//!        download keys│              │import keys
//!                     ▼              ▼
//!          ┌────────────────┐  ┌────────────────┐
//!          │ DownloadWorker │─▶│  ImportWorker  │
//!          │ (CAR export)   │  │ (node JSON-RPC)│
//!          └───────┬────────┘  └───────┬────────┘
//!                  │                   │
//!                  └─────────┬─────────┘
//!                            ▼
//!                  ┌──────────────────┐
//!                  │  Ledger (mutex)  │──▶ snapshot file
//!                  └──────────────────┘
//! ```
//!
//! The ledger is the only shared state. Queues carry keys and are allowed to
//! drop offers; the reconciler re-derives queue membership from the ledger
//! on every cycle.

mod queue;
mod reconcile;
mod syncer;
mod worker;

pub use queue::{DispatchQueue, Offer, QueueReceiver, dispatch_queue};
pub use reconcile::{CycleReport, Reconciler};
pub use syncer::Syncer;
pub use worker::{DownloadWorker, ImportWorker};
