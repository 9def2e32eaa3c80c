//! Log of blocks accepted since the last snapshot

use parking_lot::Mutex;
use polaris_primitives::H256;
use std::collections::HashSet;

/// Base hashes accepted into the DAG since the last snapshot sealed.
///
/// The acceptance pipeline appends; the snapshot service trims and drains.
#[derive(Default)]
pub struct AcceptedLog {
    inner: Mutex<Vec<H256>>,
}

impl AcceptedLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a newly accepted base hash
    pub fn push(&self, base_hash: H256) {
        self.inner.lock().push(base_hash);
    }

    /// Current length
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if the log is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Snapshot of the current contents
    pub fn view(&self) -> Vec<H256> {
        self.inner.lock().clone()
    }

    /// Keep only the first `n` entries (self-healing overflow trim)
    pub fn truncate(&self, n: usize) {
        self.inner.lock().truncate(n);
    }

    /// Remove the given hashes, keeping the remainder in order
    pub fn remove(&self, sealed: &[H256]) {
        let sealed: HashSet<&H256> = sealed.iter().collect();
        self.inner.lock().retain(|h| !sealed.contains(h));
    }

    /// Replace the whole log (rollback restore)
    pub fn restore(&self, hashes: Vec<H256>) {
        *self.inner.lock() = hashes;
    }
}
