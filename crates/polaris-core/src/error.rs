//! Acceptance error taxonomy

use polaris_primitives::H256;
use thiserror::Error;

/// Errors surfaced by the acceptance pipeline.
///
/// `AlreadyStored` and `PendingAcceptance` are informational: callers
/// swallow them without treating the round as failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AcceptanceError {
    /// The cache carried no block
    #[error("checkpoint cache carries no block")]
    MissingCheckpointBlock,

    /// The same block is already being accepted on another task
    #[error("checkpoint {0} is already pending acceptance")]
    PendingAcceptance(H256),

    /// The block is already in storage
    #[error("checkpoint {0} is already stored")]
    AlreadyStored(H256),

    /// A parent could not be resolved, even from peers
    #[error("checkpoint {0} has unresolved parents")]
    MissingParents(H256),

    /// A transaction does not extend its sender's accepted chain
    #[error("checkpoint {0} references a stale transaction chain")]
    MissingTransactionReference(H256),

    /// Some transactions are already accepted in another block
    #[error("checkpoint conflicts on {} transaction(s)", conflicting.len())]
    TipConflict {
        /// The conflicting transaction hashes
        conflicting: Vec<H256>,
    },

    /// The block failed structural or transactional validation
    #[error("checkpoint contains {} invalid transaction(s)", invalid.len())]
    ContainsInvalidTransactions {
        /// The offending transaction hashes
        invalid: Vec<H256>,
    },
}

impl AcceptanceError {
    /// Whether this outcome is informational rather than a failure
    pub fn is_informational(&self) -> bool {
        matches!(
            self,
            AcceptanceError::AlreadyStored(_) | AcceptanceError::PendingAcceptance(_)
        )
    }

    /// Whether this outcome is transient and worth retrying after resolution
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AcceptanceError::MissingParents(_)
                | AcceptanceError::MissingTransactionReference(_)
        )
    }
}

/// Result type for acceptance operations
pub type AcceptanceResult<T> = Result<T, AcceptanceError>;
