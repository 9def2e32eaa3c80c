//! Mempool error types

use polaris_primitives::{Address, Ordinal};
use polaris_types::LastTransactionRef;
use thiserror::Error;

/// Mempool errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MempoolError {
    /// A transaction does not extend the sender's accepted chain
    #[error(
        "broken chain for {address}: expected ref {{{expected_hash}, {expected_ordinal}}}, \
         got {{{got_hash}, {got_ordinal}}} at ordinal {ordinal}"
    )]
    BrokenChain {
        /// Sender whose chain was broken
        address: Address,
        /// Expected reference hash
        expected_hash: polaris_primitives::H256,
        /// Expected reference ordinal
        expected_ordinal: Ordinal,
        /// Provided reference hash
        got_hash: polaris_primitives::H256,
        /// Provided reference ordinal
        got_ordinal: Ordinal,
        /// Ordinal of the offending transaction
        ordinal: Ordinal,
    },
}

impl MempoolError {
    pub(crate) fn broken_chain(
        address: Address,
        expected: LastTransactionRef,
        got: LastTransactionRef,
        ordinal: Ordinal,
    ) -> Self {
        MempoolError::BrokenChain {
            address,
            expected_hash: expected.hash,
            expected_ordinal: expected.ordinal,
            got_hash: got.hash,
            got_ordinal: got.ordinal,
            ordinal,
        }
    }
}

/// Result type for mempool operations
pub type MempoolResult<T> = Result<T, MempoolError>;
