//! # polaris-types
//!
//! Core data model for the Polaris ledger.
//!
//! This crate provides:
//! - Transactions and per-sender chain references
//! - Peer-behavior observations
//! - Checkpoint blocks and their caches
//! - Snapshots and the resumable node state
//! - Consensus round data and proposal variants

#![warn(missing_docs)]
#![warn(clippy::all)]

mod block;
mod consensus;
mod observation;
mod snapshot;
mod transaction;

pub(crate) mod hex_bytes;

pub use block::{
    ChannelMessage, CheckpointBlock, CheckpointCache, HashSignature, ParentRef,
};
pub use consensus::{
    ConsensusDataProposal, ConsensusStage, RoundData, SelectedUnionBlock, UnionBlockProposal,
};
pub use observation::{Observation, ObservationEvent};
pub use snapshot::{
    ActiveNodes, AddressCache, GenesisObservation, Snapshot, SnapshotInfo, StoredSnapshot,
    TipData,
};
pub use transaction::{
    LastTransactionRef, Transaction, TransactionCacheData, TransactionStatus,
};
