//! # polaris-mempool
//!
//! Pending data pools for the Polaris ledger.
//!
//! This crate provides:
//! - The per-sender transaction chain service
//! - The pending transaction pool with prefix-valid, fee-ordered pull
//! - The pending observation pool

#![warn(missing_docs)]
#![warn(clippy::all)]

mod chain;
mod error;
mod observations;
mod transactions;

pub use chain::TransactionChainService;
pub use error::{MempoolError, MempoolResult};
pub use observations::PendingObservations;
pub use transactions::PendingTransactions;
