//! Address balances and node reputation

use dashmap::DashMap;
use polaris_primitives::{Address, NodeId};
use polaris_types::{AddressCache, Transaction};
use std::collections::{BTreeMap, HashMap};

/// Balance and reputation state per address
#[derive(Default)]
pub struct AddressStore {
    cache: DashMap<Address, AddressCache>,
}

impl AddressStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cache entry for an address
    pub fn get(&self, address: &Address) -> AddressCache {
        self.cache.get(address).map(|c| *c).unwrap_or_default()
    }

    /// Current balance of an address
    pub fn balance_of(&self, address: &Address) -> i128 {
        self.get(address).balance
    }

    /// Credit an address (genesis allocation, restore)
    pub fn credit(&self, address: Address, amount: i128) {
        self.cache.entry(address).or_default().balance += amount;
    }

    /// Apply an accepted transaction: debit sender by amount plus fee,
    /// credit receiver by amount.
    pub fn apply_transaction(&self, tx: &Transaction) {
        let debit = (tx.amount + tx.fee_or_zero()) as i128;
        self.cache.entry(tx.sender).or_default().balance -= debit;
        self.cache.entry(tx.receiver).or_default().balance += tx.amount as i128;
    }

    /// Export all entries for persistence
    pub fn export(&self) -> HashMap<Address, AddressCache> {
        self.cache
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect()
    }

    /// Replace all entries (rollback restore)
    pub fn restore(&self, entries: HashMap<Address, AddressCache>) {
        self.cache.clear();
        for (address, entry) in entries {
            self.cache.insert(address, entry);
        }
    }
}

/// Public reputation per node identity, fed by the external trust scorer
/// and read at snapshot rotation.
#[derive(Default)]
pub struct NodeReputationStore {
    scores: DashMap<NodeId, f64>,
}

impl NodeReputationStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a node's public reputation
    pub fn set(&self, node: NodeId, score: f64) {
        self.scores.insert(node, score);
    }

    /// A node's public reputation, when scored
    pub fn get(&self, node: &NodeId) -> Option<f64> {
        self.scores.get(node).map(|s| *s)
    }

    /// All scores, id-sorted
    pub fn export(&self) -> BTreeMap<NodeId, f64> {
        self.scores.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    /// The top `k` nodes by reputation among `candidates`, score-descending
    /// with id order as tie-break.
    pub fn top_k_among(&self, candidates: &[NodeId], k: usize) -> Vec<NodeId> {
        let mut scored: Vec<(f64, NodeId)> = candidates
            .iter()
            .map(|id| (self.get(id).unwrap_or(0.0), *id))
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });
        scored.into_iter().take(k).map(|(_, id)| id).collect()
    }
}
