//! Checkpoint block storage: the DAG as a hash-indexed map

use dashmap::DashMap;
use polaris_primitives::{Height, H256};
use polaris_types::{CheckpointBlock, CheckpointCache};
use std::sync::atomic::{AtomicU64, Ordering};

/// The accepted DAG, indexed by SOE hash with a secondary base-hash index,
/// an accepted-transaction conflict index, and per-SOE usage counters.
///
/// Blocks point to parents by hash only, so there are no reference cycles;
/// the DAG is this map.
#[derive(Default)]
pub struct CheckpointStorage {
    by_soe: DashMap<H256, CheckpointCache>,
    base_to_soe: DashMap<H256, H256>,
    /// Transaction hash -> base hash of the accepted block containing it
    accepted_transactions: DashMap<H256, H256>,
    usages: DashMap<H256, u32>,
    /// Total number of blocks ever accepted, surviving snapshot pruning
    total_accepted: AtomicU64,
}

impl CheckpointStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a cache, indexing it by SOE and base hash.
    ///
    /// Caches without a block are ignored.
    pub fn put(&self, cache: CheckpointCache) {
        let (Some(soe), Some(base)) = (cache.soe_hash(), cache.base_hash()) else {
            return;
        };
        self.base_to_soe.insert(base, soe);
        self.by_soe.insert(soe, cache);
    }

    /// Look up a cache by SOE hash, falling back to the base-hash index
    pub fn lookup(&self, hash: &H256) -> Option<CheckpointCache> {
        if let Some(cache) = self.by_soe.get(hash) {
            return Some(cache.clone());
        }
        let soe = *self.base_to_soe.get(hash)?;
        self.by_soe.get(&soe).map(|c| c.clone())
    }

    /// Check membership by SOE or base hash
    pub fn contains(&self, hash: &H256) -> bool {
        self.by_soe.contains_key(hash) || self.base_to_soe.contains_key(hash)
    }

    /// Number of blocks currently held
    pub fn len(&self) -> usize {
        self.by_soe.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.by_soe.is_empty()
    }

    /// Remove blocks by base hash, cleaning every index they appear in
    pub fn batch_remove(&self, base_hashes: &[H256]) {
        for base in base_hashes {
            let Some((_, soe)) = self.base_to_soe.remove(base) else {
                continue;
            };
            if let Some((_, cache)) = self.by_soe.remove(&soe) {
                if let Some(block) = &cache.block {
                    for tx_hash in block.transaction_hashes() {
                        self.accepted_transactions.remove(&tx_hash);
                    }
                }
            }
            self.usages.remove(&soe);
        }
    }

    /// Height of a block given its parents: `1 + max(parent heights)`, or
    /// `None` while either parent is unknown.
    pub fn calculate_height(&self, block: &CheckpointBlock) -> Option<Height> {
        let mut max_parent = None;
        for parent in &block.parents {
            let cache = self.by_soe.get(&parent.soe_hash)?;
            let height = cache.height?;
            max_parent = Some(max_parent.map_or(height, |m: Height| m.max(height)));
        }
        max_parent.map(|m| m + 1)
    }

    /// Record a child edge on an already-stored parent
    pub fn add_child(&self, parent_soe: &H256, child_base: H256) {
        if let Some(mut cache) = self.by_soe.get_mut(parent_soe) {
            cache.children.insert(child_base);
        }
    }

    /// Index the transactions of an accepted block for conflict detection
    pub fn register_accepted_transactions(&self, block: &CheckpointBlock) {
        let base = block.base_hash();
        for tx_hash in block.transaction_hashes() {
            self.accepted_transactions.insert(tx_hash, base);
        }
    }

    /// Transaction hashes of `block` that are already accepted in a
    /// different block
    pub fn conflicting_transactions(&self, block: &CheckpointBlock) -> Vec<H256> {
        let base = block.base_hash();
        block
            .transaction_hashes()
            .into_iter()
            .filter(|tx_hash| {
                self.accepted_transactions
                    .get(tx_hash)
                    .map(|other| *other != base)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Increment the usage counter of an SOE hash, returning the new count
    pub fn register_usage(&self, soe_hash: &H256) -> u32 {
        let mut entry = self.usages.entry(*soe_hash).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Current usage count of an SOE hash
    pub fn usage_of(&self, soe_hash: &H256) -> u32 {
        self.usages.get(soe_hash).map(|u| *u).unwrap_or(0)
    }

    /// Blocks with height in `(lo, hi]`, the interval sealed by a snapshot
    pub fn blocks_in_height_interval(&self, lo: Height, hi: Height) -> Vec<CheckpointCache> {
        self.by_soe
            .iter()
            .filter(|entry| matches!(entry.height, Some(h) if h > lo && h <= hi))
            .map(|entry| entry.clone())
            .collect()
    }

    /// Bump the all-time accepted block counter
    pub fn increment_total_accepted(&self, by: u64) {
        self.total_accepted.fetch_add(by, Ordering::SeqCst);
    }

    /// All-time accepted block count
    pub fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::SeqCst)
    }
}
