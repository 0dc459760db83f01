//! CARv1 exporter.
//!
//! # Archive Layout
//!
//! ```text
//! [varint header_len][dag-cbor {roots: [root], version: 1}]
//! [varint len][cid bytes][block bytes]     (one section per block)
//! ```
//!
//! Blocks are emitted in depth-first pre-order, each identifier only on its
//! first occurrence, so the byte stream depends only on the DAG.
//!
//! # Pipeline
//!
//! A producer task walks the DAG and encodes sections; the caller's task
//! drains them into the writer. The two are joined by a bounded channel of
//! `window` sections, and the producer keeps at most `window` block fetches
//! in flight per DAG level. A failure on either side ends the export with
//! that error: producer errors travel down the channel, and a consumer error
//! aborts the producer.

use super::{Node, NodeResolver};
use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use cid::Cid;
use futures_util::{StreamExt, TryStreamExt, stream};
use std::collections::{HashSet, VecDeque};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Default number of blocks fetched ahead of the writer.
pub const DEFAULT_WINDOW: usize = 8;

/// Exports DAGs as CARv1 archives.
#[derive(Clone)]
pub struct CarExporter {
    resolver: NodeResolver,
    window: usize,
}

impl CarExporter {
    pub fn new(resolver: NodeResolver, window: usize) -> Self {
        Self {
            resolver,
            window: window.max(1),
        }
    }

    /// Stream the DAG under `root` into `writer`.
    ///
    /// Returns the number of bytes written once the whole archive has been
    /// written and flushed.
    pub async fn export<W>(&self, root: Cid, writer: &mut W, cancel: &CancellationToken) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let (tx, mut rx) = mpsc::channel::<Result<Bytes>>(self.window);
        let producer = tokio::spawn(produce(
            self.resolver.clone(),
            root,
            self.window,
            tx,
            cancel.clone(),
        ));

        let mut written = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    producer.abort();
                    return Err(Error::Cancelled);
                }
                next = rx.recv() => next,
            };
            match next {
                Some(Ok(section)) => {
                    if let Err(e) = writer.write_all(&section).await {
                        producer.abort();
                        return Err(e.into());
                    }
                    written += section.len() as u64;
                }
                Some(Err(e)) => {
                    producer.abort();
                    return Err(e);
                }
                None => break,
            }
        }

        // The channel also closes when the producer panics; only a clean
        // return means the archive is complete.
        if let Err(e) = producer.await {
            error!(root = %root, "car producer stopped: {}", e);
            return Err(Error::PipeClosed);
        }

        writer.flush().await?;
        Ok(written)
    }
}

async fn produce(
    resolver: NodeResolver,
    root: Cid,
    window: usize,
    tx: mpsc::Sender<Result<Bytes>>,
    cancel: CancellationToken,
) {
    if let Err(e) = walk(&resolver, root, window, &tx, &cancel).await {
        // A closed channel means the consumer already gave up.
        let _ = tx.send(Err(e)).await;
    }
}

/// Children of one DAG level still to be emitted.
struct Frame {
    /// Not yet fetched.
    pending: VecDeque<Cid>,
    /// Fetched, in link order.
    ready: VecDeque<Node>,
}

impl Frame {
    fn new(links: Vec<Cid>) -> Self {
        Self {
            pending: links.into(),
            ready: VecDeque::new(),
        }
    }
}

async fn walk(
    resolver: &NodeResolver,
    root: Cid,
    window: usize,
    tx: &mpsc::Sender<Result<Bytes>>,
    cancel: &CancellationToken,
) -> Result<()> {
    send(tx, car_header(&root)).await?;

    let mut seen: HashSet<Cid> = HashSet::new();
    let mut blocks = 0u64;
    let mut stack = vec![Frame {
        pending: VecDeque::new(),
        ready: VecDeque::from([resolver.resolve(&root).await?]),
    }];

    while let Some(frame) = stack.last_mut() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Some(node) = frame.ready.pop_front() {
            if seen.insert(node.cid) {
                send(tx, car_section(&node)).await?;
                blocks += 1;
                if !node.links.is_empty() {
                    stack.push(Frame::new(node.links));
                }
            }
            continue;
        }

        if frame.pending.is_empty() {
            stack.pop();
            continue;
        }

        let mut batch: Vec<Cid> = Vec::with_capacity(window);
        while batch.len() < window {
            let Some(cid) = frame.pending.pop_front() else {
                break;
            };
            if !seen.contains(&cid) && !batch.contains(&cid) {
                batch.push(cid);
            }
        }
        let nodes: Vec<Node> = stream::iter(batch)
            .map(|cid| async move { resolver.resolve(&cid).await })
            .buffered(window)
            .try_collect()
            .await?;
        frame.ready.extend(nodes);
    }

    debug!(root = %root, "car export produced {} blocks", blocks);
    metrics::counter!("car_blocks_written_total").increment(blocks);
    Ok(())
}

async fn send(tx: &mpsc::Sender<Result<Bytes>>, section: Bytes) -> Result<()> {
    tx.send(Ok(section)).await.map_err(|_| Error::PipeClosed)
}

/// `varint(len) | dag-cbor {"roots": [root], "version": 1}`
fn car_header(root: &Cid) -> Bytes {
    let cid_bytes = root.to_bytes();

    let mut body = BytesMut::with_capacity(cid_bytes.len() + 32);
    body.put_u8(0xa2); // map(2)
    cbor_text(&mut body, "roots");
    body.put_u8(0x81); // array(1)
    body.put_slice(&[0xd8, 0x2a]); // tag(42): CID
    cbor_bytes_header(&mut body, cid_bytes.len() + 1);
    body.put_u8(0x00); // multibase identity prefix
    body.put_slice(&cid_bytes);
    cbor_text(&mut body, "version");
    body.put_u8(0x01);

    let mut out = BytesMut::with_capacity(body.len() + 2);
    prost::encoding::encode_varint(body.len() as u64, &mut out);
    out.put_slice(&body);
    out.freeze()
}

/// `varint(len(cid) + len(data)) | cid | data`
fn car_section(node: &Node) -> Bytes {
    let cid_bytes = node.cid.to_bytes();
    let len = cid_bytes.len() + node.data.len();
    let mut out = BytesMut::with_capacity(len + 10);
    prost::encoding::encode_varint(len as u64, &mut out);
    out.put_slice(&cid_bytes);
    out.put_slice(&node.data);
    out.freeze()
}

fn cbor_text(buf: &mut BytesMut, text: &str) {
    cbor_head(buf, 3, text.len());
    buf.put_slice(text.as_bytes());
}

fn cbor_bytes_header(buf: &mut BytesMut, len: usize) {
    cbor_head(buf, 2, len);
}

fn cbor_head(buf: &mut BytesMut, major: u8, len: usize) {
    let major = major << 5;
    match len {
        0..=23 => buf.put_u8(major | len as u8),
        24..=0xff => {
            buf.put_u8(major | 24);
            buf.put_u8(len as u8);
        }
        0x100..=0xffff => {
            buf.put_u8(major | 25);
            buf.put_u16(len as u16);
        }
        _ => {
            buf.put_u8(major | 26);
            buf.put_u32(len as u32);
        }
    }
}
