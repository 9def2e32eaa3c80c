//! Interval sealing and rollback restore, end to end

use polaris_core::{AcceptanceConfig, AcceptanceService};
use polaris_crypto::Keypair;
use polaris_mempool::{PendingObservations, TransactionChainService};
use polaris_metrics::Metrics;
use polaris_network::LoopbackNetwork;
use polaris_primitives::{Height, NodeId, H256};
use polaris_snapshot::{
    DirectoryBackend, RollbackConfig, RollbackService, RollbackTarget, SnapshotConfig,
    SnapshotError, SnapshotFileStore, SnapshotService,
};
use polaris_storage::{
    AcceptedLog, AddressStore, CheckpointStorage, NodeReputationStore, TipService,
    TipServiceConfig,
};
use polaris_types::{
    AddressCache, CheckpointBlock, CheckpointCache, GenesisObservation, ParentRef, Snapshot,
    SnapshotInfo, StoredSnapshot,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

struct Stack {
    storage: Arc<CheckpointStorage>,
    tips: Arc<TipService>,
    accepted_log: Arc<AcceptedLog>,
    addresses: Arc<AddressStore>,
    acceptance: Arc<AcceptanceService>,
    snapshot: Arc<SnapshotService>,
    file_store: Arc<SnapshotFileStore>,
    roots: Vec<ParentRef>,
    _tmp: tempfile::TempDir,
}

fn node(n: u8) -> NodeId {
    NodeId::from_bytes([n; 32])
}

fn build_stack(config: SnapshotConfig) -> Stack {
    let tmp = tempfile::tempdir().unwrap();
    let storage = Arc::new(CheckpointStorage::new());
    let tips = Arc::new(TipService::new(
        TipServiceConfig::default(),
        Arc::clone(&storage),
    ));
    let chain = Arc::new(TransactionChainService::new());
    let addresses = Arc::new(AddressStore::new());
    let accepted_log = Arc::new(AcceptedLog::new());
    let reputation = Arc::new(NodeReputationStore::new());
    let observations = Arc::new(PendingObservations::new());
    let metrics = Arc::new(Metrics::new());
    let network = LoopbackNetwork::new();
    let (handle, _rx) = network.register(node(1), None);

    let acceptance = Arc::new(AcceptanceService::new(
        AcceptanceConfig::default(),
        Arc::clone(&storage),
        Arc::clone(&tips),
        Arc::clone(&chain),
        Arc::clone(&addresses),
        Arc::clone(&accepted_log),
        Arc::new(handle),
        Arc::clone(&metrics),
    ));

    // Genesis-like roots at height 0, both registered as tips.
    let mut roots = Vec::new();
    for marker in [0xA0u8, 0xB0] {
        let root = CheckpointBlock::new(
            vec![],
            vec![],
            vec![],
            vec![],
            vec![H256::from_bytes([marker; 32])],
        );
        let cache = CheckpointCache::with_height(root.clone(), 0);
        acceptance.seed(cache.clone());
        tips.update(&cache);
        roots.push(ParentRef {
            soe_hash: root.soe_hash(),
            base_hash: root.base_hash(),
        });
    }

    let file_store = Arc::new(SnapshotFileStore::new(tmp.path().join("local")).unwrap());
    let snapshot = Arc::new(SnapshotService::new(
        node(1),
        Arc::new(Keypair::generate()),
        config,
        Arc::clone(&storage),
        Arc::clone(&tips),
        Arc::clone(&addresses),
        reputation,
        chain,
        Arc::clone(&accepted_log),
        Arc::clone(&acceptance),
        observations,
        Arc::clone(&file_store),
        metrics,
    ));

    Stack {
        storage,
        tips,
        accepted_log,
        addresses,
        acceptance,
        snapshot,
        file_store,
        roots,
        _tmp: tmp,
    }
}

fn test_config() -> SnapshotConfig {
    SnapshotConfig {
        snapshot_height_interval: 2,
        snapshot_height_delay_interval: 0,
        min_usable_space: 0,
        initial_active_full_nodes: [node(1)].into_iter().collect(),
        ..Default::default()
    }
}

fn child(parents: [ParentRef; 2], marker: u8) -> CheckpointBlock {
    CheckpointBlock::new(
        vec![],
        parents.to_vec(),
        vec![],
        vec![],
        vec![H256::from_bytes([marker; 32])],
    )
}

/// Accept sibling pairs at heights 1..=4: every level references both
/// blocks of the previous level, so old tips retire as the DAG climbs.
async fn grow_dag(stack: &Stack) -> Vec<(Height, H256)> {
    let mut accepted = Vec::new();
    let mut level = [stack.roots[0], stack.roots[1]];
    let mut marker = 1u8;

    for height in 1..=4u64 {
        let mut next_level = Vec::new();
        for _ in 0..2 {
            let block = child(level, marker);
            marker += 1;
            let cache = stack
                .acceptance
                .accept(CheckpointCache::new(block.clone()), &[])
                .await
                .unwrap()
                .unwrap();
            assert_eq!(cache.height, Some(height));
            next_level.push(ParentRef {
                soe_hash: block.soe_hash(),
                base_hash: block.base_hash(),
            });
            accepted.push((height, block.base_hash()));
        }
        level = [next_level[0], next_level[1]];
    }
    accepted
}

#[tokio::test]
async fn snapshot_seals_the_first_interval() {
    let stack = build_stack(test_config());
    let accepted = grow_dag(&stack).await;
    assert_eq!(stack.accepted_log.len(), 8);
    assert_eq!(stack.tips.min_tip_height(), Some(4));

    let hash = stack.snapshot.attempt_snapshot().await.unwrap();

    // The snapshot sealed exactly the blocks with height in (0, 2].
    let sealed: BTreeSet<H256> = accepted
        .iter()
        .filter(|(h, _)| *h <= 2)
        .map(|(_, base)| *base)
        .collect();
    let stored = stack.snapshot.stored_snapshot();
    let in_snapshot: BTreeSet<H256> =
        stored.snapshot.checkpoint_blocks.iter().copied().collect();
    assert_eq!(in_snapshot, sealed);

    assert_eq!(stack.snapshot.last_snapshot_height(), 2);
    assert_eq!(stack.accepted_log.len(), 4);
    for base in &sealed {
        assert!(!stack.storage.contains(base));
        assert!(!stack.accepted_log.view().contains(base));
    }
    assert_eq!(stack.snapshot.snapshot_hashes(), vec![hash]);

    // The hashes are recorded sorted.
    let mut expected_sorted: Vec<H256> = sealed.into_iter().collect();
    expected_sorted.sort();
    assert_eq!(stored.snapshot.checkpoint_blocks, expected_sorted);

    // Round-trip law: the persisted form deserializes to an equal value.
    let reread = stack.file_store.read_snapshot(&hash).unwrap();
    assert_eq!(reread, stored);
    let info = stack.file_store.read_snapshot_info(&hash).unwrap();
    assert_eq!(info.last_snapshot_height, 2);
    assert_eq!(info.accepted_cbs_since_snapshot.len(), 4);
}

#[tokio::test]
async fn second_attempt_needs_higher_tips() {
    let stack = build_stack(test_config());
    grow_dag(&stack).await;
    stack.snapshot.attempt_snapshot().await.unwrap();

    // The next interval is (2, 4], but the tips sit exactly at 4.
    let result = stack.snapshot.attempt_snapshot().await;
    assert!(matches!(
        result,
        Err(SnapshotError::HeightIntervalConditionNotMet { required: 4, .. })
    ));
}

#[tokio::test]
async fn empty_log_fails_attempt() {
    let stack = build_stack(test_config());
    grow_dag(&stack).await;
    stack.snapshot.attempt_snapshot().await.unwrap();

    stack.accepted_log.restore(vec![]);
    let result = stack.snapshot.attempt_snapshot().await;
    assert!(matches!(
        result,
        Err(SnapshotError::NoAcceptedCbsSinceSnapshot)
    ));
}

#[tokio::test]
async fn non_member_cannot_snapshot() {
    let config = SnapshotConfig {
        initial_active_full_nodes: [node(9)].into_iter().collect(),
        ..test_config()
    };
    let stack = build_stack(config);
    grow_dag(&stack).await;

    let result = stack.snapshot.attempt_snapshot().await;
    assert!(matches!(result, Err(SnapshotError::NodeNotInActivePool)));
}

#[tokio::test]
async fn overflowed_log_trims_and_fails() {
    let config = SnapshotConfig {
        max_accepted_cb_hashes_in_memory: 4,
        ..test_config()
    };
    let stack = build_stack(config);
    grow_dag(&stack).await;
    assert_eq!(stack.accepted_log.len(), 8);

    let result = stack.snapshot.attempt_snapshot().await;
    assert!(matches!(
        result,
        Err(SnapshotError::MaxCbHashesInMemory { count: 8 })
    ));
    // Self-healing trim kept the head of the log.
    assert_eq!(stack.accepted_log.len(), 8.min(100));
}

#[tokio::test]
async fn inactive_window_fails_attempt() {
    let stack = build_stack(test_config());
    grow_dag(&stack).await;

    stack
        .snapshot
        .set_active_between(polaris_snapshot::ActiveBetweenHeights {
            joined: 10,
            left: None,
        });
    let result = stack.snapshot.attempt_snapshot().await;
    assert!(matches!(
        result,
        Err(SnapshotError::ActiveBetweenHeightsConditionNotMet { next_height: 2 })
    ));
}

// ==================== Rollback ====================

fn empty_genesis() -> GenesisObservation {
    let genesis = CheckpointBlock::new(
        vec![],
        vec![],
        vec![],
        vec![],
        vec![H256::from_bytes([0x01; 32])],
    );
    let child = |marker: u8| {
        CheckpointBlock::new(
            vec![],
            vec![ParentRef {
                soe_hash: genesis.soe_hash(),
                base_hash: genesis.base_hash(),
            }],
            vec![],
            vec![],
            vec![H256::from_bytes([marker; 32])],
        )
    };
    GenesisObservation {
        initial_distribution: child(0x02),
        initial_distribution2: child(0x03),
        genesis,
    }
}

fn restorable_info(height: Height, negative: bool) -> (SnapshotInfo, H256) {
    let snapshot = Snapshot {
        last_snapshot: H256::from_bytes([0x0F; 32]),
        checkpoint_blocks: vec![H256::from_bytes([0x10; 32])],
        public_reputation: Default::default(),
        next_active_nodes: Default::default(),
    };
    let hash = snapshot.hash();
    let stored = StoredSnapshot {
        snapshot,
        checkpoint_cache: vec![],
    };
    let mut address_cache = HashMap::new();
    address_cache.insert(
        polaris_primitives::Address::from_bytes([0x21; 20]),
        AddressCache {
            balance: if negative { -5 } else { 500 },
            reputation: Some(0.8),
        },
    );
    (
        SnapshotInfo {
            snapshot: stored,
            accepted_cbs_since_snapshot: vec![],
            last_snapshot_height: height,
            snapshot_hashes: vec![hash],
            address_cache,
            tips: HashMap::new(),
            last_accepted_tx_ref: HashMap::new(),
        },
        hash,
    )
}

fn publish(
    backend: &DirectoryBackend,
    height: Height,
    hash: H256,
    info: &SnapshotInfo,
) {
    backend
        .write_snapshot(
            height,
            hash,
            &serde_json::to_vec(&info.snapshot).unwrap(),
        )
        .unwrap();
    backend
        .write_snapshot_info(height, hash, &serde_json::to_vec(info).unwrap())
        .unwrap();
    backend
        .write_genesis(&serde_json::to_vec(&empty_genesis()).unwrap())
        .unwrap();
}

#[tokio::test]
async fn rollback_restores_state() {
    let stack = build_stack(test_config());
    let cloud = tempfile::tempdir().unwrap();
    let backend = DirectoryBackend::new(cloud.path());

    let (info, hash) = restorable_info(10, false);
    publish(&backend, 10, hash, &info);

    let rollback = RollbackService::new(
        RollbackConfig::default(),
        vec![Arc::new(DirectoryBackend::new(cloud.path()))],
        Arc::clone(&stack.snapshot),
        Arc::clone(&stack.acceptance),
        Arc::clone(&stack.file_store),
    );

    let (height, restored_hash) = rollback.rollback(RollbackTarget::At { height: 10, hash }).await.unwrap();
    assert_eq!((height, restored_hash), (10, hash));
    assert!(rollback.participated_in_rollback());

    // Restored state matches the published file.
    assert_eq!(stack.snapshot.last_snapshot_height(), 10);
    assert_eq!(stack.snapshot.active_between().joined, 8);
    assert_eq!(
        stack
            .addresses
            .balance_of(&polaris_primitives::Address::from_bytes([0x21; 20])),
        500
    );
    // Genesis landed in the DAG.
    let genesis = empty_genesis();
    assert!(stack.storage.contains(&genesis.genesis.base_hash()));

    // Local artifacts and the majority marker were written.
    assert!(stack.file_store.read_snapshot(&hash).is_ok());
    let marker = stack.file_store.read_majority_marker().unwrap().unwrap();
    assert_eq!((marker.height, marker.hash), (10, hash));
}

#[tokio::test]
async fn rollback_rejects_negative_balances() {
    let stack = build_stack(test_config());
    let cloud = tempfile::tempdir().unwrap();
    let backend = DirectoryBackend::new(cloud.path());

    let (info, hash) = restorable_info(10, true);
    publish(&backend, 10, hash, &info);

    let rollback = RollbackService::new(
        RollbackConfig::default(),
        vec![Arc::new(DirectoryBackend::new(cloud.path()))],
        Arc::clone(&stack.snapshot),
        Arc::clone(&stack.acceptance),
        Arc::clone(&stack.file_store),
    );

    let result = rollback.rollback(RollbackTarget::At { height: 10, hash }).await;
    assert!(matches!(
        result,
        Err(polaris_snapshot::RollbackError::InvalidBalances { .. })
    ));
    assert!(!rollback.participated_in_rollback());
    assert_eq!(stack.snapshot.last_snapshot_height(), 0);
}

#[tokio::test]
async fn rollback_fails_over_to_next_backend() {
    let stack = build_stack(test_config());
    let empty_cloud = tempfile::tempdir().unwrap();
    let good_cloud = tempfile::tempdir().unwrap();
    let backend = DirectoryBackend::new(good_cloud.path());

    let (info, hash) = restorable_info(6, false);
    publish(&backend, 6, hash, &info);

    let rollback = RollbackService::new(
        RollbackConfig::default(),
        vec![
            Arc::new(DirectoryBackend::new(empty_cloud.path())),
            Arc::new(DirectoryBackend::new(good_cloud.path())),
        ],
        Arc::clone(&stack.snapshot),
        Arc::clone(&stack.acceptance),
        Arc::clone(&stack.file_store),
    );

    // Head backend has nothing; the tail serves the restore.
    let restored = rollback.rollback(RollbackTarget::Highest).await.unwrap();
    assert_eq!(restored, (6, hash));
    assert_eq!(stack.snapshot.last_snapshot_height(), 6);
}
