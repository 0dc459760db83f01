//! Error types for the offline deals data model.

use crate::DealStatus;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while handling deals and their records.
#[derive(Error, Debug)]
pub enum Error {
    /// A status change that is not an edge of the deal lifecycle graph.
    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Status the record currently has.
        from: DealStatus,
        /// Status that was requested.
        to: DealStatus,
    },

    /// A content identifier could not be parsed.
    #[error("invalid content identifier '{input}': {reason}")]
    InvalidCid {
        /// The offending input.
        input: String,
        /// Why parsing failed.
        reason: String,
    },
}
