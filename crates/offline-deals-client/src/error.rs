//! Error types for the offline deals client.

use cid::Cid;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while synchronizing deals.
#[derive(Error, Debug)]
pub enum Error {
    /// Deal model error (illegal transition, bad CID).
    #[error(transparent)]
    Core(#[from] offline_deals_core::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The dataset API answered with a non-200 domain code.
    #[error("API error {code}: {msg}")]
    Api {
        /// Domain code from the response envelope.
        code: i64,
        /// Message from the response envelope.
        msg: String,
    },

    /// The local archive does not match the size recorded at download time.
    #[error("verify data size failed: expected {expected} bytes, found {actual}")]
    Verification {
        /// Size recorded when the download finished.
        expected: u64,
        /// Size found on disk.
        actual: u64,
    },

    /// The block store does not have the requested block.
    #[error("block not found: {0}")]
    BlockNotFound(Cid),

    /// The block store answered with an unexpected status.
    #[error("block store error for {cid}: HTTP {status}")]
    Store {
        /// Block that was requested.
        cid: Cid,
        /// HTTP status code.
        status: u16,
    },

    /// A block could not be decoded into a node.
    #[error("decode error for {cid}: {reason}")]
    Decode {
        /// Block that failed to decode.
        cid: Cid,
        /// What went wrong.
        reason: String,
    },

    /// A block uses a codec the resolver cannot read links from.
    #[error("unsupported codec 0x{codec:x} for {cid}")]
    UnsupportedCodec {
        /// Block with the unknown codec.
        cid: Cid,
        /// Multicodec code.
        codec: u64,
    },

    /// The archive pipe closed before the stream was complete.
    #[error("archive pipe closed")]
    PipeClosed,

    /// The storage node's endpoint or token could not be read.
    #[error("cannot read {path}: {reason}, verify the process is running {node_type}")]
    NodeEndpoint {
        /// File that could not be read or parsed.
        path: String,
        /// Which node process is expected to provide it.
        node_type: &'static str,
        /// What went wrong.
        reason: String,
    },

    /// The storage node rejected a JSON-RPC call.
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML parsing error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// The operation was cancelled by shutdown.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the error leaves no way to make progress without operator action.
    ///
    /// The storage node's endpoint and token have no fallback, so failing to
    /// read them stops the syncer.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::NodeEndpoint { .. } | Error::Config(_))
    }
}
