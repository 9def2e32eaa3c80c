//! Round error taxonomy

use polaris_core::AcceptanceError;
use polaris_types::ConsensusStage;
use thiserror::Error;

/// Errors raised while driving a consensus round.
///
/// `PreviousStage` faults only the offending message; every other variant
/// ends the round, and the manager returns the round's pulled data to the
/// mempools.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoundError {
    /// A stage timed out with no proposals at all
    #[error("stage expired with no proposals")]
    EmptyProposals,

    /// Too few proposals to continue
    #[error("not enough proposals: {count} of {total}")]
    NotEnoughProposals {
        /// Proposals present
        count: usize,
        /// Facilitator count (peers plus self)
        total: usize,
    },

    /// A message arrived for a stage the round already passed
    #[error("message targets already-passed stage {stage}")]
    PreviousStage {
        /// The round's current stage
        stage: ConsensusStage,
    },

    /// The majority block's height could not be computed
    #[error("majority checkpoint height unknown")]
    HeightMissing,

    /// Acceptance failed terminally
    #[error(transparent)]
    Accept(#[from] AcceptanceError),

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for round operations
pub type RoundResult<T> = Result<T, RoundError>;
