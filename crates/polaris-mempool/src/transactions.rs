//! Pending transaction pool with prefix-valid, fee-ordered pull

use crate::chain::TransactionChainService;
use parking_lot::Mutex;
use polaris_primitives::{Address, H256};
use polaris_types::{Transaction, TransactionCacheData, TransactionStatus};
use std::collections::HashMap;
use std::sync::Arc;

struct PoolEntry {
    data: TransactionCacheData,
    /// Monotone arrival sequence, used to break fee ties
    seq: u64,
}

#[derive(Default)]
struct PoolInner {
    by_hash: HashMap<H256, PoolEntry>,
    next_seq: u64,
}

/// Pending transaction pool.
///
/// One mutex guards the whole pool so a pull can never observe a sender's
/// chain split by a concurrent put.
pub struct PendingTransactions {
    inner: Mutex<PoolInner>,
    chain: Arc<TransactionChainService>,
}

impl PendingTransactions {
    /// Create a pool over the given chain service
    pub fn new(chain: Arc<TransactionChainService>) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            chain,
        }
    }

    /// Insert or overwrite a transaction by hash.
    ///
    /// Re-delivery keeps the original arrival position.
    pub fn put(&self, transaction: Transaction, status: TransactionStatus) {
        let hash = transaction.hash();
        let mut inner = self.inner.lock();
        let seq = match inner.by_hash.get(&hash) {
            Some(existing) => existing.seq,
            None => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                seq
            }
        };
        inner.by_hash.insert(
            hash,
            PoolEntry {
                data: TransactionCacheData {
                    transaction,
                    status,
                },
                seq,
            },
        );
    }

    /// Insert a batch as `Unknown` (data returned from a failed round)
    pub fn put_back(&self, transactions: Vec<Transaction>) {
        for tx in transactions {
            self.put(tx, TransactionStatus::Unknown);
        }
    }

    /// Drop transactions by hash (accepted into a block elsewhere)
    pub fn remove(&self, hashes: &[H256]) {
        let mut inner = self.inner.lock();
        for hash in hashes {
            inner.by_hash.remove(hash);
        }
    }

    /// Look up a transaction by hash
    pub fn lookup(&self, hash: &H256) -> Option<TransactionCacheData> {
        self.inner.lock().by_hash.get(hash).map(|e| e.data.clone())
    }

    /// Check membership by hash
    pub fn contains(&self, hash: &H256) -> bool {
        self.inner.lock().by_hash.contains_key(hash)
    }

    /// Number of pending transactions
    pub fn len(&self) -> usize {
        self.inner.lock().by_hash.len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically select up to `max_count` transactions for a round.
    ///
    /// Senders are considered as chains: each sender contributes the longest
    /// prefix of its ordinal-sorted transactions that extends the sender's
    /// last accepted reference. Chains are then ordered by descending total
    /// fee (arrival order breaks ties) and concatenated; the first
    /// `max_count` transactions are removed from the pool and returned.
    pub fn pull_for_consensus(&self, max_count: usize) -> Vec<Transaction> {
        let mut inner = self.inner.lock();

        // Group by sender, keeping arrival sequence for tie-breaks.
        let mut by_sender: HashMap<Address, Vec<(u64, Transaction)>> = HashMap::new();
        for entry in inner.by_hash.values() {
            by_sender
                .entry(entry.data.transaction.sender)
                .or_default()
                .push((entry.seq, entry.data.transaction.clone()));
        }

        struct SenderChain {
            transactions: Vec<Transaction>,
            fee_total: u128,
            first_seq: u64,
        }

        let mut chains: Vec<SenderChain> = Vec::new();
        for (sender, mut group) in by_sender {
            group.sort_by_key(|(_, tx)| tx.ordinal);

            // Walk the valid prefix starting at the last accepted reference.
            let mut expected = self.chain.get_last_accepted(&sender);
            let mut prefix: Vec<Transaction> = Vec::new();
            let mut first_seq = u64::MAX;
            for (seq, tx) in group {
                if tx.last_tx_ref != expected || tx.ordinal != expected.ordinal + 1 {
                    break;
                }
                expected = polaris_types::LastTransactionRef {
                    hash: tx.hash(),
                    ordinal: tx.ordinal,
                };
                first_seq = first_seq.min(seq);
                prefix.push(tx);
            }

            if !prefix.is_empty() {
                let fee_total = prefix.iter().map(|tx| tx.fee_or_zero()).sum();
                chains.push(SenderChain {
                    transactions: prefix,
                    fee_total,
                    first_seq,
                });
            }
        }

        // Highest-fee chains first; equal fees keep arrival order.
        chains.sort_by(|a, b| {
            b.fee_total
                .cmp(&a.fee_total)
                .then(a.first_seq.cmp(&b.first_seq))
        });

        let selected: Vec<Transaction> = chains
            .into_iter()
            .flat_map(|c| c.transactions)
            .take(max_count)
            .collect();

        for tx in &selected {
            inner.by_hash.remove(&tx.hash());
        }

        tracing::debug!(
            pulled = selected.len(),
            remaining = inner.by_hash.len(),
            "pulled transactions for consensus"
        );
        selected
    }
}
