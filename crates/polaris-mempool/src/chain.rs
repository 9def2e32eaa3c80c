//! Per-sender last-accepted transaction references

use crate::error::{MempoolError, MempoolResult};
use dashmap::DashMap;
use polaris_primitives::Address;
use polaris_types::{LastTransactionRef, Transaction};
use std::collections::HashMap;

/// Tracks, per sender, the reference of the last accepted transaction.
///
/// Updates for one address are serialized by the map's entry lock; distinct
/// addresses update in parallel.
#[derive(Default)]
pub struct TransactionChainService {
    last_accepted: DashMap<Address, LastTransactionRef>,
}

impl TransactionChainService {
    /// Create an empty chain service
    pub fn new() -> Self {
        Self::default()
    }

    /// The last accepted reference for an address, defaulting to the
    /// address's genesis reference.
    pub fn get_last_accepted(&self, address: &Address) -> LastTransactionRef {
        self.last_accepted
            .get(address)
            .map(|r| *r)
            .unwrap_or_else(|| LastTransactionRef::genesis(address))
    }

    /// Advance the sender's chain after the transaction was accepted.
    ///
    /// Succeeds iff the transaction references the current chain head and
    /// carries the next ordinal.
    pub fn apply_after_acceptance(&self, tx: &Transaction) -> MempoolResult<()> {
        let mut entry = self
            .last_accepted
            .entry(tx.sender)
            .or_insert_with(|| LastTransactionRef::genesis(&tx.sender));
        let current = *entry;

        if tx.last_tx_ref != current || tx.ordinal != current.ordinal + 1 {
            return Err(MempoolError::broken_chain(
                tx.sender,
                current,
                tx.last_tx_ref,
                tx.ordinal,
            ));
        }

        *entry = LastTransactionRef {
            hash: tx.hash(),
            ordinal: tx.ordinal,
        };
        Ok(())
    }

    /// Replace the whole reference map (rollback restore)
    pub fn restore(&self, refs: HashMap<Address, LastTransactionRef>) {
        self.last_accepted.clear();
        for (address, reference) in refs {
            self.last_accepted.insert(address, reference);
        }
    }

    /// Export the reference map for persistence
    pub fn export(&self) -> HashMap<Address, LastTransactionRef> {
        self.last_accepted
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect()
    }
}
