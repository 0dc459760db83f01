//! Streaming CAR export of a deal's data DAG.
//!
//! ```text
//! StoreConnector ──connect()──▶ BlockSource ──▶ NodeResolver ──▶ CarExporter ──▶ file
//!  (fresh creds                  (gateway)       (fetch, verify,   (producer task,
//!   per attempt)                                  decode links)     bounded pipe)
//! ```

mod export;
mod gateway;
mod resolver;

pub use export::{CarExporter, DEFAULT_WINDOW};
pub use gateway::{GatewayBlockSource, RemoteStoreConnector};
pub use resolver::{DAG_PB, IDENTITY, Node, NodeResolver, RAW, SHA2_256};

#[cfg(test)]
pub(crate) use resolver::{PbLink, PbNode};

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use std::sync::Arc;

/// Fetches raw blocks by content identifier.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Fetch the block named by `cid`.
    async fn get_block(&self, cid: &Cid) -> Result<Bytes>;
}

/// Opens a [`BlockSource`] with freshly issued credentials.
///
/// Called once per download attempt; credentials are short-lived and never
/// cached between attempts.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Obtain credentials and open a block source.
    async fn connect(&self) -> Result<Arc<dyn BlockSource>>;
}
