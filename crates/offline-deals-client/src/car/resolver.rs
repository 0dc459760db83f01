//! Block fetching and node decoding.

use super::BlockSource;
use crate::{Error, Result};
use bytes::Bytes;
use cid::Cid;
use prost::Message;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Multicodec code of dag-pb nodes.
pub const DAG_PB: u64 = 0x70;
/// Multicodec code of raw leaves.
pub const RAW: u64 = 0x55;
/// Multihash code of the identity hash.
pub const IDENTITY: u64 = 0x00;
/// Multihash code of sha2-256.
pub const SHA2_256: u64 = 0x12;

/// dag-pb link.
#[derive(Clone, PartialEq, Message)]
pub struct PbLink {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub hash: Option<Vec<u8>>,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(uint64, optional, tag = "3")]
    pub tsize: Option<u64>,
}

/// dag-pb node. Links are field 2 and data field 1, as on the wire.
#[derive(Clone, PartialEq, Message)]
pub struct PbNode {
    #[prost(message, repeated, tag = "2")]
    pub links: Vec<PbLink>,
    #[prost(bytes = "vec", optional, tag = "1")]
    pub data: Option<Vec<u8>>,
}

/// A fetched block and the links it points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Identifier of the block.
    pub cid: Cid,
    /// Raw block bytes, exactly as they go into the archive.
    pub data: Bytes,
    /// Child links in encoding order.
    pub links: Vec<Cid>,
}

/// Fetches blocks and decodes their links.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct NodeResolver {
    source: Arc<dyn BlockSource>,
}

impl NodeResolver {
    pub fn new(source: Arc<dyn BlockSource>) -> Self {
        Self { source }
    }

    /// Fetch, verify and decode the node named by `cid`.
    pub async fn resolve(&self, cid: &Cid) -> Result<Node> {
        let start = Instant::now();
        let hash = cid.hash();

        let data = if hash.code() == IDENTITY {
            Bytes::copy_from_slice(hash.digest())
        } else {
            let data = self.source.get_block(cid).await?;
            if hash.code() == SHA2_256 && Sha256::digest(&data).as_slice() != hash.digest() {
                return Err(Error::Decode {
                    cid: *cid,
                    reason: "block does not match its sha2-256 hash".to_string(),
                });
            }
            data
        };

        let links = decode_links(cid, &data)?;

        let elapsed = start.elapsed();
        debug!("get node by cid {}, cost time {:?}", cid, elapsed);
        metrics::histogram!("car_block_fetch_seconds").record(elapsed.as_secs_f64());

        Ok(Node {
            cid: *cid,
            data,
            links,
        })
    }
}

fn decode_links(cid: &Cid, data: &[u8]) -> Result<Vec<Cid>> {
    match cid.codec() {
        RAW => Ok(Vec::new()),
        DAG_PB => {
            let node = PbNode::decode(data).map_err(|e| Error::Decode {
                cid: *cid,
                reason: e.to_string(),
            })?;
            node.links
                .iter()
                .map(|link| {
                    let hash = link.hash.as_deref().ok_or_else(|| Error::Decode {
                        cid: *cid,
                        reason: "link without hash".to_string(),
                    })?;
                    Cid::try_from(hash).map_err(|e| Error::Decode {
                        cid: *cid,
                        reason: format!("bad link: {e}"),
                    })
                })
                .collect()
        }
        codec => Err(Error::UnsupportedCodec { cid: *cid, codec }),
    }
}
