//! In-memory collaborators for tests.

use crate::api::DealSource;
use crate::car::{BlockSource, DAG_PB, PbLink, PbNode, RAW, SHA2_256, StoreConnector};
use crate::node::DealImporter;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use cid::multihash::Multihash;
use offline_deals_core::Deal;
use parking_lot::Mutex;
use prost::Message;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

fn sha256_cid(codec: u64, data: &[u8]) -> Cid {
    let mh = Multihash::<64>::wrap(SHA2_256, &Sha256::digest(data)).unwrap();
    Cid::new_v1(codec, mh)
}

/// A deal whose data CID is derived from `seed`.
pub fn deal(seed: u32) -> Deal {
    deal_for(sha256_cid(RAW, &seed.to_be_bytes()), seed)
}

/// A deal for the DAG rooted at `root`.
pub fn deal_for(root: Cid, seed: u32) -> Deal {
    Deal {
        miner: format!("f0{}", 1000 + seed),
        client: "f1testclient".to_string(),
        data_cid: root,
        verified: false,
        prop_cid: sha256_cid(0x71, format!("proposal {seed}").as_bytes()),
        piece_size: 2048,
        piece_cid: None,
    }
}

// =============================================================================
// Blocks
// =============================================================================

/// Block store backed by a map. Counts fetches.
#[derive(Default)]
pub struct MemoryBlockSource {
    blocks: Mutex<HashMap<Cid, Bytes>>,
    fetches: AtomicUsize,
    stall_on: Mutex<Option<Cid>>,
    stalled: Notify,
    released: Notify,
}

impl MemoryBlockSource {
    pub fn insert(&self, cid: Cid, data: Bytes) {
        self.blocks.lock().insert(cid, data);
    }

    pub fn remove(&self, cid: &Cid) {
        self.blocks.lock().remove(cid);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Make fetches of `cid` hang until [`MemoryBlockSource::release`].
    pub fn stall_on(&self, cid: Cid) {
        *self.stall_on.lock() = Some(cid);
    }

    /// Let a hanging fetch continue.
    pub fn release(&self) {
        *self.stall_on.lock() = None;
        self.released.notify_one();
    }

    /// Wait until a fetch is hanging on the stalled block.
    pub async fn wait_stalled(&self) {
        self.stalled.notified().await;
    }
}

#[async_trait]
impl BlockSource for MemoryBlockSource {
    async fn get_block(&self, cid: &Cid) -> Result<Bytes> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if *self.stall_on.lock() == Some(*cid) {
            self.stalled.notify_one();
            self.released.notified().await;
        }
        self.blocks
            .lock()
            .get(cid)
            .cloned()
            .ok_or(Error::BlockNotFound(*cid))
    }
}

/// Builds small DAGs into a [`MemoryBlockSource`].
#[derive(Default)]
pub struct DagBuilder {
    source: MemoryBlockSource,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a raw leaf.
    pub fn raw(&mut self, data: &[u8]) -> Cid {
        let cid = sha256_cid(RAW, data);
        self.source.insert(cid, Bytes::copy_from_slice(data));
        cid
    }

    /// Add a CIDv1 dag-pb node.
    pub fn pb(&mut self, links: &[Cid], data: &[u8]) -> Cid {
        let block = encode_pb(links, data);
        let cid = sha256_cid(DAG_PB, &block);
        self.source.insert(cid, Bytes::from(block));
        cid
    }

    /// Add a CIDv0 dag-pb node.
    pub fn pb_v0(&mut self, links: &[Cid], data: &[u8]) -> Cid {
        let block = encode_pb(links, data);
        let mh = Multihash::<64>::wrap(SHA2_256, &Sha256::digest(&block)).unwrap();
        let cid = Cid::new_v0(mh).unwrap();
        self.source.insert(cid, Bytes::from(block));
        cid
    }

    pub fn into_source(self) -> MemoryBlockSource {
        self.source
    }
}

fn encode_pb(links: &[Cid], data: &[u8]) -> Vec<u8> {
    PbNode {
        links: links
            .iter()
            .enumerate()
            .map(|(i, cid)| PbLink {
                hash: Some(cid.to_bytes()),
                name: Some(format!("{i}")),
                tsize: Some(0),
            })
            .collect(),
        data: Some(data.to_vec()),
    }
    .encode_to_vec()
}

/// Split a CARv1 stream into its roots and `(cid, data)` sections.
pub fn read_car(bytes: &[u8]) -> (Vec<Cid>, Vec<(Cid, Vec<u8>)>) {
    let mut cursor = bytes;
    let header_len = prost::encoding::decode_varint(&mut cursor).unwrap() as usize;
    let (header, mut rest) = cursor.split_at(header_len);

    // Single root: tag(42) followed by a one-byte-length byte string.
    let tag = header.windows(2).position(|w| w == [0xd8u8, 0x2a].as_slice()).unwrap();
    assert_eq!(header[tag + 2], 0x58);
    let len = header[tag + 3] as usize;
    let cid_bytes = &header[tag + 4..tag + 4 + len];
    assert_eq!(cid_bytes[0], 0x00);
    let root = Cid::try_from(&cid_bytes[1..]).unwrap();

    let mut blocks = Vec::new();
    while !rest.is_empty() {
        let len = prost::encoding::decode_varint(&mut rest).unwrap() as usize;
        let (section, tail) = rest.split_at(len);
        let mut reader = section;
        let cid = Cid::read_bytes(&mut reader).unwrap();
        blocks.push((cid, reader.to_vec()));
        rest = tail;
    }
    (vec![root], blocks)
}

/// Connector handing out one shared in-memory source.
pub struct MemoryStoreConnector {
    source: Arc<MemoryBlockSource>,
    connects: AtomicUsize,
}

impl MemoryStoreConnector {
    pub fn new(source: MemoryBlockSource) -> Self {
        Self {
            source: Arc::new(source),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn source(&self) -> &MemoryBlockSource {
        &self.source
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreConnector for MemoryStoreConnector {
    async fn connect(&self) -> Result<Arc<dyn BlockSource>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.source.clone())
    }
}

// =============================================================================
// Deal source and importer
// =============================================================================

/// Deal source returning whatever the test last scripted.
#[derive(Default)]
pub struct ScriptedDealSource {
    deals: Mutex<Option<Vec<Deal>>>,
    calls: AtomicUsize,
}

impl ScriptedDealSource {
    pub fn new(deals: Vec<Deal>) -> Self {
        Self {
            deals: Mutex::new(Some(deals)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_deals(&self, deals: Vec<Deal>) {
        *self.deals.lock() = Some(deals);
    }

    /// Make every call fail until the next [`ScriptedDealSource::set_deals`].
    pub fn fail(&self) {
        *self.deals.lock() = None;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DealSource for ScriptedDealSource {
    async fn pending_deals(&self) -> Result<Vec<Deal>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.deals.lock().clone().ok_or(Error::Api {
            code: 500,
            msg: "scripted failure".to_string(),
        })
    }
}

/// Importer that records calls and fails on demand.
#[derive(Default)]
pub struct RecordingImporter {
    calls: Mutex<Vec<(Cid, PathBuf)>>,
    failures: AtomicUsize,
    fatal: Mutex<bool>,
    stall: Mutex<bool>,
    stalled: Notify,
}

impl RecordingImporter {
    /// Fail the next `n` imports with an RPC error.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Fail every import as if the node's endpoint files were missing.
    pub fn fail_fatally(&self) {
        *self.fatal.lock() = true;
    }

    /// Make every import hang until the caller gives up.
    pub fn stall(&self) {
        *self.stall.lock() = true;
    }

    /// Wait until an import is hanging.
    pub async fn wait_stalled(&self) {
        self.stalled.notified().await;
    }

    pub fn calls(&self) -> Vec<(Cid, PathBuf)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl DealImporter for RecordingImporter {
    async fn import(&self, prop_cid: &Cid, path: &Path) -> Result<()> {
        if *self.fatal.lock() {
            return Err(Error::NodeEndpoint {
                path: "/nonexistent/api".to_string(),
                node_type: "markets",
                reason: "No such file or directory".to_string(),
            });
        }
        self.calls.lock().push((*prop_cid, path.to_path_buf()));
        if *self.stall.lock() {
            self.stalled.notify_one();
            std::future::pending::<()>().await;
        }
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Rpc {
                code: 1,
                message: "scripted failure".to_string(),
            });
        }
        Ok(())
    }
}
