//! Snapshot and rollback error taxonomy

use polaris_primitives::{Address, Height, H256};
use thiserror::Error;

/// Why a snapshot attempt did not seal.
///
/// Precondition failures have no side effects (except the self-healing
/// trim) and are retried on the next tick; I/O failures are counted in
/// metrics and retried with interleaved cleanup.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// This node is not in the last snapshot's full active pool
    #[error("node is not part of the active facilitator pool")]
    NodeNotInActivePool,

    /// The node was not active across the interval being sealed
    #[error("node not active across heights at {next_height}")]
    ActiveBetweenHeightsConditionNotMet {
        /// The interval end that failed the check
        next_height: Height,
    },

    /// Too little usable disk space
    #[error("not enough disk space: {available} < {required} bytes")]
    NotEnoughSpace {
        /// Usable bytes
        available: u64,
        /// Required bytes
        required: u64,
    },

    /// The accepted-block log overflowed and was trimmed
    #[error("accepted checkpoint log overflowed at {count} entries")]
    MaxCbHashesInMemory {
        /// Entries before trimming
        count: usize,
    },

    /// Nothing accepted since the last snapshot
    #[error("no accepted checkpoints since the last snapshot")]
    NoAcceptedCbsSinceSnapshot,

    /// The DAG has not advanced far enough past the seal point
    #[error("minimum tip height {min_tip_height:?} has not passed {required}")]
    HeightIntervalConditionNotMet {
        /// Current minimum tip height, when known
        min_tip_height: Option<Height>,
        /// Height the tips must exceed
        required: Height,
    },

    /// No accepted blocks fall inside the interval
    #[error("no blocks within the height interval")]
    NoBlocksWithinHeightInterval,

    /// Inconsistent internal state
    #[error("illegal snapshot state: {0}")]
    IllegalState(String),

    /// Disk write failed after retries
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failed
    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Result type for snapshot operations
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Why a rollback restore failed
#[derive(Debug, Error)]
pub enum RollbackError {
    /// The restored address cache contains a negative balance
    #[error("negative balance for {address} in rollback data")]
    InvalidBalances {
        /// The offending address
        address: Address,
    },

    /// No backend could serve the requested snapshot
    #[error("no backend could serve snapshot {height}-{hash}")]
    BackendUnavailable {
        /// Requested height
        height: Height,
        /// Requested hash
        hash: H256,
    },

    /// No snapshot exists in any backend
    #[error("no snapshot found in any backend")]
    NothingToRestore,

    /// Legacy-schema migration failed
    #[error("snapshot schema migration failed: {0}")]
    Migration(String),

    /// Backend or local I/O failed
    #[error("rollback io error: {0}")]
    Io(#[from] std::io::Error),

    /// Deserialization failed
    #[error("rollback decoding error: {0}")]
    Decoding(#[from] serde_json::Error),
}
