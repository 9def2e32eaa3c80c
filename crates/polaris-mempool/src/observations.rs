//! Pending observation pool

use parking_lot::Mutex;
use polaris_primitives::H256;
use polaris_types::Observation;
use std::collections::HashMap;

#[derive(Default)]
struct ObsInner {
    by_hash: HashMap<H256, (u64, Observation)>,
    next_seq: u64,
}

/// Pending observation pool.
///
/// Same surface as the transaction pool minus the chain constraint: pull
/// returns observations in arrival order.
#[derive(Default)]
pub struct PendingObservations {
    inner: Mutex<ObsInner>,
}

impl PendingObservations {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite an observation by hash
    pub fn put(&self, observation: Observation) {
        let hash = observation.hash();
        let mut inner = self.inner.lock();
        let seq = match inner.by_hash.get(&hash) {
            Some((seq, _)) => *seq,
            None => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                seq
            }
        };
        inner.by_hash.insert(hash, (seq, observation));
    }

    /// Insert a batch (data returned from a failed round)
    pub fn put_back(&self, observations: Vec<Observation>) {
        for obs in observations {
            self.put(obs);
        }
    }

    /// Drop observations by hash (accepted into a block elsewhere)
    pub fn remove(&self, hashes: &[H256]) {
        let mut inner = self.inner.lock();
        for hash in hashes {
            inner.by_hash.remove(hash);
        }
    }

    /// Look up an observation by hash
    pub fn lookup(&self, hash: &H256) -> Option<Observation> {
        self.inner.lock().by_hash.get(hash).map(|(_, o)| o.clone())
    }

    /// Check membership by hash
    pub fn contains(&self, hash: &H256) -> bool {
        self.inner.lock().by_hash.contains_key(hash)
    }

    /// Number of pending observations
    pub fn len(&self) -> usize {
        self.inner.lock().by_hash.len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically remove and return up to `max_count` observations in
    /// arrival order.
    pub fn pull_for_consensus(&self, max_count: usize) -> Vec<Observation> {
        let mut inner = self.inner.lock();

        let mut entries: Vec<(u64, H256)> = inner
            .by_hash
            .iter()
            .map(|(hash, (seq, _))| (*seq, *hash))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);

        let mut selected = Vec::new();
        for (_, hash) in entries.into_iter().take(max_count) {
            if let Some((_, obs)) = inner.by_hash.remove(&hash) {
                selected.push(obs);
            }
        }
        selected
    }
}
