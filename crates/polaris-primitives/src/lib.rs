//! # polaris-primitives
//!
//! Primitive types for the Polaris ledger.
//!
//! This crate provides the fundamental data types used throughout the system.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod address;
mod hash;
mod id;

pub use address::{Address, AddressError};
pub use hash::{Hash, HashError, H256};
pub use id::{NodeId, RoundId};

/// Checkpoint block height type
pub type Height = u64;

/// Per-sender transaction ordinal type
pub type Ordinal = u64;
