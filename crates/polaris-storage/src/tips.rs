//! Bounded tip set used for parent selection

use crate::checkpoint::CheckpointStorage;
use parking_lot::Mutex;
use polaris_primitives::{Height, NodeId, H256};
use polaris_types::{CheckpointCache, ParentRef, TipData};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Tip service limits
#[derive(Debug, Clone)]
pub struct TipServiceConfig {
    /// Maximum number of tips held at once
    pub max_tips: usize,
    /// A tip is retired once referenced this many times
    pub max_tip_usage: u32,
    /// Minimum facilitators required to start a round
    pub min_facilitators: usize,
}

impl Default for TipServiceConfig {
    fn default() -> Self {
        Self {
            max_tips: 6,
            max_tip_usage: 2,
            min_facilitators: 2,
        }
    }
}

/// Result of a tip pull: the two parents for a new block and the peers that
/// will facilitate the round
#[derive(Debug, Clone)]
pub struct PulledTips {
    /// The two parent references
    pub tips: [ParentRef; 2],
    /// The participating peer set
    pub peers: BTreeSet<NodeId>,
}

/// Maintains the bounded set of accepted blocks eligible to be referenced
/// as parents by new blocks.
pub struct TipService {
    config: TipServiceConfig,
    storage: Arc<CheckpointStorage>,
    tips: Mutex<HashMap<H256, TipData>>,
}

impl TipService {
    /// Create a tip service over the given storage
    pub fn new(config: TipServiceConfig, storage: Arc<CheckpointStorage>) -> Self {
        Self {
            config,
            storage,
            tips: Mutex::new(HashMap::new()),
        }
    }

    /// Process a newly accepted block: bump each parent's usage, retire
    /// overused parents, and admit the block as a tip if there is room.
    ///
    /// Holding one lock across the whole step keeps `|tips| <= max_tips`
    /// and `num_uses <= max_tip_usage` under concurrent updates.
    pub fn update(&self, cache: &CheckpointCache) {
        let Some(block) = &cache.block else {
            return;
        };
        let mut tips = self.tips.lock();

        for parent in &block.parents {
            let uses = self.storage.register_usage(&parent.soe_hash);
            if let Some(tip) = tips.get_mut(&parent.soe_hash) {
                tip.num_uses = uses;
            }
            if uses >= self.config.max_tip_usage {
                tips.remove(&parent.soe_hash);
            }
        }

        if tips.len() < self.config.max_tips {
            let soe = block.soe_hash();
            tips.insert(
                soe,
                TipData {
                    soe_hash: soe,
                    base_hash: block.base_hash(),
                    num_uses: self.storage.usage_of(&soe),
                },
            );
        }
    }

    /// Select two tips and the facilitator set for a new round.
    ///
    /// Returns `None` when fewer than two tips exist or the ready set does
    /// not cover the facilitator minimum.
    pub fn pull(&self, ready_facilitators: &BTreeSet<NodeId>) -> Option<PulledTips> {
        if ready_facilitators.len() < self.config.min_facilitators {
            return None;
        }

        let tips = self.tips.lock();
        if tips.len() < 2 {
            return None;
        }

        // Least-used tips first, hash order as the deterministic tie-break.
        let mut candidates: Vec<&TipData> = tips.values().collect();
        candidates.sort_by_key(|t| (t.num_uses, t.soe_hash));

        let first = candidates[0];
        let second = candidates[1];
        Some(PulledTips {
            tips: [
                ParentRef {
                    soe_hash: first.soe_hash,
                    base_hash: first.base_hash,
                },
                ParentRef {
                    soe_hash: second.soe_hash,
                    base_hash: second.base_hash,
                },
            ],
            peers: ready_facilitators.clone(),
        })
    }

    /// Smallest height among current tips, when every tip's height is known
    pub fn min_tip_height(&self) -> Option<Height> {
        let tips = self.tips.lock();
        if tips.is_empty() {
            return None;
        }
        let mut min = Height::MAX;
        for tip in tips.values() {
            let height = self.storage.lookup(&tip.soe_hash)?.height?;
            min = min.min(height);
        }
        Some(min)
    }

    /// Number of current tips
    pub fn len(&self) -> usize {
        self.tips.lock().len()
    }

    /// Check if the tip set is empty
    pub fn is_empty(&self) -> bool {
        self.tips.lock().is_empty()
    }

    /// Export the tip map for persistence
    pub fn export(&self) -> HashMap<H256, TipData> {
        self.tips.lock().clone()
    }

    /// Replace the tip map (rollback restore / bootstrap)
    pub fn restore(&self, tips: HashMap<H256, TipData>) {
        *self.tips.lock() = tips;
    }
}
