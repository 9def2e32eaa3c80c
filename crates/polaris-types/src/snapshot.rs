//! Snapshots: sealed intervals of the accepted DAG, and the resumable state

use polaris_crypto::keccak256;
use polaris_primitives::{Address, Height, NodeId, H256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::block::{CheckpointBlock, CheckpointCache};
use crate::transaction::LastTransactionRef;

/// The full and light node sets authorized to facilitate the next epoch
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveNodes {
    /// Full nodes eligible to facilitate consensus and snapshots
    pub full: BTreeSet<NodeId>,
    /// Light nodes eligible to observe
    pub light: BTreeSet<NodeId>,
}

/// A sealed interval of accepted checkpoint blocks, chained to its
/// predecessor by hash
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Hash of the previous snapshot in the chain
    pub last_snapshot: H256,
    /// Base hashes of the sealed blocks, sorted
    pub checkpoint_blocks: Vec<H256>,
    /// Public reputation per node, id-sorted
    pub public_reputation: BTreeMap<NodeId, f64>,
    /// Active pool for the next epoch
    pub next_active_nodes: ActiveNodes,
}

impl Snapshot {
    /// The sentinel first snapshot of the chain
    pub fn zero() -> Self {
        Self {
            last_snapshot: H256::ZERO,
            checkpoint_blocks: Vec::new(),
            public_reputation: BTreeMap::new(),
            next_active_nodes: ActiveNodes::default(),
        }
    }

    /// Whether this is the sentinel first snapshot
    pub fn is_zero(&self) -> bool {
        self.last_snapshot.is_zero() && self.checkpoint_blocks.is_empty()
    }

    /// Deterministic snapshot hash over the canonical JSON encoding.
    ///
    /// All collections are sorted by construction, so the encoding is
    /// stable across nodes.
    pub fn hash(&self) -> H256 {
        // Serialization of a plain data struct cannot fail.
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        keccak256(&encoded)
    }
}

/// The self-contained persisted form of a snapshot
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    /// The sealed snapshot
    pub snapshot: Snapshot,
    /// Full caches of the sealed blocks
    pub checkpoint_cache: Vec<CheckpointCache>,
}

/// Balance and reputation held for one address
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressCache {
    /// Current balance; signed so restore validation can reject corrupt data
    pub balance: i128,
    /// Public reputation of the address owner, when scored
    pub reputation: Option<f64>,
}

/// Usage-tracked tip entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipData {
    /// SOE hash of the tip block
    pub soe_hash: H256,
    /// Base hash of the tip block
    pub base_hash: H256,
    /// How many accepted blocks reference this tip as parent
    pub num_uses: u32,
}

/// Everything needed to resume a node: the last stored snapshot plus the
/// state accumulated since it was sealed
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// The last stored snapshot
    pub snapshot: StoredSnapshot,
    /// Base hashes accepted since that snapshot
    pub accepted_cbs_since_snapshot: Vec<H256>,
    /// Height at which the last snapshot sealed
    pub last_snapshot_height: Height,
    /// Hashes of all snapshots taken so far
    pub snapshot_hashes: Vec<H256>,
    /// Balances and reputation per address
    pub address_cache: HashMap<Address, AddressCache>,
    /// Current tip set
    pub tips: HashMap<H256, TipData>,
    /// Per-sender last accepted transaction reference
    pub last_accepted_tx_ref: HashMap<Address, LastTransactionRef>,
}

/// The bootstrap artifact: the genesis block and its two empty children,
/// which seed the DAG and the initial tip set
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenesisObservation {
    /// The genesis checkpoint block
    pub genesis: CheckpointBlock,
    /// First empty child of genesis
    pub initial_distribution: CheckpointBlock,
    /// Second empty child of genesis
    pub initial_distribution2: CheckpointBlock,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u8) -> NodeId {
        NodeId::from_bytes([n; 32])
    }

    #[test]
    fn test_snapshot_zero() {
        let zero = Snapshot::zero();
        assert!(zero.is_zero());
        assert_eq!(zero.hash(), Snapshot::zero().hash());
    }

    #[test]
    fn test_snapshot_hash_chains() {
        let zero = Snapshot::zero();
        let next = Snapshot {
            last_snapshot: zero.hash(),
            checkpoint_blocks: vec![H256::from_bytes([1u8; 32])],
            public_reputation: BTreeMap::new(),
            next_active_nodes: ActiveNodes::default(),
        };
        assert!(!next.is_zero());
        assert_ne!(next.hash(), zero.hash());
        assert_eq!(next.last_snapshot, zero.hash());
    }

    #[test]
    fn test_snapshot_hash_covers_active_nodes() {
        let mut a = Snapshot::zero();
        a.checkpoint_blocks.push(H256::from_bytes([1u8; 32]));
        let mut b = a.clone();
        b.next_active_nodes.full.insert(node(1));
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_stored_snapshot_roundtrip() {
        let stored = StoredSnapshot {
            snapshot: Snapshot::zero(),
            checkpoint_cache: vec![],
        };
        let json = serde_json::to_string(&stored).unwrap();
        let back: StoredSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(stored, back);
    }

    #[test]
    fn test_snapshot_info_roundtrip() {
        let mut address_cache = HashMap::new();
        address_cache.insert(
            Address::from_bytes([1u8; 20]),
            AddressCache {
                balance: 1_000,
                reputation: Some(0.5),
            },
        );
        let info = SnapshotInfo {
            snapshot: StoredSnapshot {
                snapshot: Snapshot::zero(),
                checkpoint_cache: vec![],
            },
            accepted_cbs_since_snapshot: vec![H256::from_bytes([2u8; 32])],
            last_snapshot_height: 4,
            snapshot_hashes: vec![H256::from_bytes([3u8; 32])],
            address_cache,
            tips: HashMap::new(),
            last_accepted_tx_ref: HashMap::new(),
        };
        let json = serde_json::to_string(&info).unwrap();
        let back: SnapshotInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(info, back);
    }
}
