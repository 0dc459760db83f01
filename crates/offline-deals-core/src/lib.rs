//! Core types and shared utilities for the offline deals client.
//!
//! This crate provides:
//! - The deal model ([`Deal`], [`DealRecord`]) and its lifecycle ([`DealStatus`])
//! - The JSON codec for content identifiers used by the dataset API and the
//!   storage node
//! - Prometheus metrics helpers
//! - Shared error types

pub mod cid_json;
mod deal;
mod error;
pub mod metrics;

pub use cid::Cid;
pub use deal::{CAR_EXTENSION, Deal, DealRecord, DealStatus, car_path};
pub use error::{Error, Result};
