//! The single-writer admission gate for the DAG

use crate::error::{AcceptanceError, AcceptanceResult};
use crate::state::NodeState;
use parking_lot::{Mutex, RwLock};
use polaris_mempool::TransactionChainService;
use polaris_metrics::Metrics;
use polaris_network::PeerClient;
use polaris_primitives::{NodeId, H256};
use polaris_storage::{AcceptedLog, AddressStore, CheckpointStorage, TipService};
use polaris_types::{CheckpointBlock, CheckpointCache, LastTransactionRef};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Acceptance pipeline limits
#[derive(Debug, Clone)]
pub struct AcceptanceConfig {
    /// Maximum recursion depth for parent resolution
    pub max_resolution_depth: usize,
    /// Per-request timeout for peer parent fetches, in milliseconds
    pub resolution_timeout_ms: u64,
}

impl Default for AcceptanceConfig {
    fn default() -> Self {
        Self {
            max_resolution_depth: 10,
            resolution_timeout_ms: 15_000,
        }
    }
}

/// Validates checkpoint blocks and admits them into the DAG.
///
/// Parent resolution and validation run without the admission lock so
/// network I/O can proceed in parallel; the commit step is serialized by
/// `accept_lock`, whose acquisition order also decides which of two
/// conflicting blocks wins.
pub struct AcceptanceService {
    storage: Arc<CheckpointStorage>,
    tips: Arc<TipService>,
    chain: Arc<TransactionChainService>,
    addresses: Arc<AddressStore>,
    accepted_log: Arc<AcceptedLog>,
    peers: Arc<dyn PeerClient>,
    metrics: Arc<Metrics>,
    config: AcceptanceConfig,
    accept_lock: tokio::sync::Mutex<()>,
    pending: Mutex<HashSet<H256>>,
    node_state: RwLock<NodeState>,
    sync_buffer: Mutex<Vec<CheckpointCache>>,
}

impl AcceptanceService {
    /// Wire up the pipeline
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AcceptanceConfig,
        storage: Arc<CheckpointStorage>,
        tips: Arc<TipService>,
        chain: Arc<TransactionChainService>,
        addresses: Arc<AddressStore>,
        accepted_log: Arc<AcceptedLog>,
        peers: Arc<dyn PeerClient>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            storage,
            tips,
            chain,
            addresses,
            accepted_log,
            peers,
            metrics,
            config,
            accept_lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(HashSet::new()),
            node_state: RwLock::new(NodeState::Ready),
            sync_buffer: Mutex::new(Vec::new()),
        }
    }

    /// Current node state
    pub fn node_state(&self) -> NodeState {
        *self.node_state.read()
    }

    /// Switch node state
    pub fn set_node_state(&self, state: NodeState) {
        *self.node_state.write() = state;
    }

    /// Blocks buffered while the final sync was running
    pub fn drain_sync_buffer(&self) -> Vec<CheckpointCache> {
        std::mem::take(&mut *self.sync_buffer.lock())
    }

    /// Hold the admission lock for the duration of the returned guard.
    ///
    /// The snapshot service acquires this while sealing an interval so no
    /// block is admitted half inside, half outside the seal.
    pub async fn lock_admissions(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.accept_lock.lock().await
    }

    /// Admit a trusted cache directly (genesis bootstrap, rollback restore).
    ///
    /// Skips resolution and validation; the height must already be set.
    pub fn seed(&self, cache: CheckpointCache) {
        if let Some(block) = &cache.block {
            self.storage.register_accepted_transactions(block);
            for parent in &block.parents {
                self.storage.add_child(&parent.soe_hash, block.base_hash());
            }
        }
        self.storage.put(cache);
    }

    /// Accept a checkpoint into the DAG, resolving parents from peers as
    /// needed. Returns the admitted cache with its height, or `None` when
    /// the node buffered the block during final sync.
    pub async fn accept(
        &self,
        cache: CheckpointCache,
        resolution_peers: &[NodeId],
    ) -> AcceptanceResult<Option<CheckpointCache>> {
        self.accept_with_depth(cache, resolution_peers, 0).await
    }

    fn accept_boxed<'a>(
        &'a self,
        cache: CheckpointCache,
        resolution_peers: &'a [NodeId],
        depth: usize,
    ) -> Pin<Box<dyn Future<Output = AcceptanceResult<Option<CheckpointCache>>> + Send + 'a>>
    {
        Box::pin(self.accept_with_depth(cache, resolution_peers, depth))
    }

    async fn accept_with_depth(
        &self,
        cache: CheckpointCache,
        resolution_peers: &[NodeId],
        depth: usize,
    ) -> AcceptanceResult<Option<CheckpointCache>> {
        let block = cache
            .block
            .clone()
            .ok_or(AcceptanceError::MissingCheckpointBlock)?;
        let base_hash = block.base_hash();

        if self.node_state() == NodeState::DownloadCompleteAwaitingFinalSync {
            tracing::debug!(%base_hash, "buffering checkpoint until final sync completes");
            self.sync_buffer.lock().push(cache);
            return Ok(None);
        }

        if !self.pending.lock().insert(base_hash) {
            return Err(AcceptanceError::PendingAcceptance(base_hash));
        }

        let result = self
            .accept_guarded(block, base_hash, resolution_peers, depth)
            .await;

        self.pending.lock().remove(&base_hash);
        result
    }

    async fn accept_guarded(
        &self,
        block: CheckpointBlock,
        base_hash: H256,
        resolution_peers: &[NodeId],
        depth: usize,
    ) -> AcceptanceResult<Option<CheckpointCache>> {
        if self.storage.contains(&base_hash) {
            return Err(AcceptanceError::AlreadyStored(base_hash));
        }

        self.resolve_parents(&block, resolution_peers, depth).await;

        // First conflict look: cheap rejection before validation. The
        // authoritative check runs again under the admission lock.
        let conflicting = self.storage.conflicting_transactions(&block);
        if !conflicting.is_empty() {
            self.metrics.counter("accept.tip_conflicts", 1);
            return Err(AcceptanceError::TipConflict { conflicting });
        }

        self.validate_structure(&block)?;

        let height = self
            .storage
            .calculate_height(&block)
            .ok_or(AcceptanceError::MissingParents(base_hash))?;

        let _guard = self.accept_lock.lock().await;

        // Re-check under the lock: a concurrent admission may have taken
        // one of our transactions or this very block.
        if self.storage.contains(&base_hash) {
            return Err(AcceptanceError::AlreadyStored(base_hash));
        }
        let conflicting = self.storage.conflicting_transactions(&block);
        if !conflicting.is_empty() {
            self.metrics.counter("accept.tip_conflicts", 1);
            return Err(AcceptanceError::TipConflict { conflicting });
        }
        self.validate_chain_refs(&block)
            .map_err(|_| AcceptanceError::MissingTransactionReference(base_hash))?;

        // Commit: everything below is infallible in-memory state.
        for tx in &block.transactions {
            // Checked above while holding the lock.
            let _ = self.chain.apply_after_acceptance(tx);
            self.addresses.apply_transaction(tx);
        }
        let admitted = CheckpointCache::with_height(block.clone(), height);
        self.storage.put(admitted.clone());
        self.storage.register_accepted_transactions(&block);
        for parent in &block.parents {
            self.storage.add_child(&parent.soe_hash, base_hash);
        }
        self.tips.update(&admitted);
        self.accepted_log.push(base_hash);

        self.metrics.counter("accept.blocks_accepted", 1);
        tracing::info!(%base_hash, height, "checkpoint accepted");
        Ok(Some(admitted))
    }

    /// Fetch and recursively accept unknown parents, bounded by depth.
    ///
    /// Failures here are not terminal: the height computation afterwards
    /// decides whether the block can proceed.
    async fn resolve_parents(
        &self,
        block: &CheckpointBlock,
        resolution_peers: &[NodeId],
        depth: usize,
    ) {
        if depth >= self.config.max_resolution_depth || resolution_peers.is_empty() {
            return;
        }

        for parent in &block.parents {
            if self.storage.contains(&parent.soe_hash) {
                continue;
            }

            let fetch = self
                .peers
                .fetch_checkpoint(resolution_peers, parent.soe_hash);
            let fetched = tokio::time::timeout(
                Duration::from_millis(self.config.resolution_timeout_ms),
                fetch,
            )
            .await;

            match fetched {
                Ok(Ok(Some(parent_cache))) => {
                    if let Err(err) = self
                        .accept_boxed(parent_cache, resolution_peers, depth + 1)
                        .await
                    {
                        if !err.is_informational() {
                            tracing::warn!(
                                soe_hash = %parent.soe_hash,
                                error = %err,
                                "resolved parent failed acceptance"
                            );
                        }
                    }
                }
                Ok(Ok(None)) => {
                    tracing::debug!(soe_hash = %parent.soe_hash, "parent not found on peers");
                }
                Ok(Err(err)) => {
                    tracing::warn!(soe_hash = %parent.soe_hash, error = %err, "parent fetch failed");
                }
                Err(_) => {
                    tracing::warn!(soe_hash = %parent.soe_hash, "parent fetch timed out");
                }
            }
        }
    }

    /// Structural validation: two parents, valid signatures, valid
    /// transaction signatures.
    fn validate_structure(&self, block: &CheckpointBlock) -> AcceptanceResult<()> {
        if block.parents.len() != 2 {
            return Err(AcceptanceError::ContainsInvalidTransactions {
                invalid: block.transaction_hashes(),
            });
        }
        if !block.verify_signatures() {
            return Err(AcceptanceError::ContainsInvalidTransactions {
                invalid: block.transaction_hashes(),
            });
        }

        let invalid: Vec<H256> = block
            .transactions
            .iter()
            .filter(|tx| !tx.verify_signature())
            .map(|tx| tx.hash())
            .collect();
        if !invalid.is_empty() {
            return Err(AcceptanceError::ContainsInvalidTransactions { invalid });
        }
        Ok(())
    }

    /// Transactional validation: per sender, the block's transactions must
    /// form a chain extending the sender's last accepted reference.
    fn validate_chain_refs(&self, block: &CheckpointBlock) -> Result<(), ()> {
        let mut per_sender: HashMap<_, Vec<_>> = HashMap::new();
        for tx in &block.transactions {
            per_sender.entry(tx.sender).or_default().push(tx);
        }

        for (sender, mut txs) in per_sender {
            txs.sort_by_key(|tx| tx.ordinal);
            let mut expected = self.chain.get_last_accepted(&sender);
            for tx in txs {
                if tx.last_tx_ref != expected || tx.ordinal != expected.ordinal + 1 {
                    return Err(());
                }
                expected = LastTransactionRef {
                    hash: tx.hash(),
                    ordinal: tx.ordinal,
                };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polaris_crypto::Keypair;
    use polaris_network::LoopbackNetwork;
    use polaris_primitives::Address;
    use polaris_storage::TipServiceConfig;
    use polaris_types::{ParentRef, Transaction};

    fn node(n: u8) -> NodeId {
        NodeId::from_bytes([n; 32])
    }

    fn addr(n: u8) -> Address {
        Address::from_bytes([n; 20])
    }

    fn signed_tx(keypair: &Keypair, ordinal: u64, last_tx_ref: LastTransactionRef) -> Transaction {
        Transaction::new(keypair, addr(0xEE), 5, Some(1), ordinal, last_tx_ref).unwrap()
    }

    struct Fixture {
        service: Arc<AcceptanceService>,
        storage: Arc<CheckpointStorage>,
        chain: Arc<TransactionChainService>,
        addresses: Arc<AddressStore>,
        accepted_log: Arc<AcceptedLog>,
        /// Two seeded tips usable as parents
        parents: Vec<ParentRef>,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(CheckpointStorage::new());
        let tips = Arc::new(TipService::new(
            TipServiceConfig::default(),
            Arc::clone(&storage),
        ));
        let chain = Arc::new(TransactionChainService::new());
        let addresses = Arc::new(AddressStore::new());
        let accepted_log = Arc::new(AcceptedLog::new());
        let network = LoopbackNetwork::new();
        let (handle, _rx) = network.register(node(1), None);

        let service = Arc::new(AcceptanceService::new(
            AcceptanceConfig::default(),
            Arc::clone(&storage),
            Arc::clone(&tips),
            Arc::clone(&chain),
            Arc::clone(&addresses),
            Arc::clone(&accepted_log),
            Arc::new(handle),
            Arc::new(Metrics::new()),
        ));

        // Seed two roots at height 0 to serve as parents.
        let mut parents = Vec::new();
        for marker in [1u8, 2] {
            let root = CheckpointBlock::new(
                vec![],
                vec![],
                vec![],
                vec![],
                vec![H256::from_bytes([marker; 32])],
            );
            let cache = CheckpointCache::with_height(root.clone(), 0);
            parents.push(ParentRef {
                soe_hash: root.soe_hash(),
                base_hash: root.base_hash(),
            });
            service.seed(cache);
        }

        Fixture {
            service,
            storage,
            chain,
            addresses,
            accepted_log,
            parents,
        }
    }

    fn block_over(parents: &[ParentRef], txs: Vec<Transaction>) -> CheckpointBlock {
        CheckpointBlock::new(txs, parents.to_vec(), vec![], vec![], vec![])
    }

    #[tokio::test]
    async fn test_accept_happy_path() {
        let fx = fixture();
        let kp = Keypair::generate();
        let sender = kp.address();
        let t = signed_tx(&kp, 1, LastTransactionRef::genesis(&sender));
        let block = block_over(&fx.parents, vec![t.clone()]);
        let base = block.base_hash();

        let admitted = fx
            .service
            .accept(CheckpointCache::new(block), &[])
            .await
            .unwrap()
            .unwrap();

        assert_eq!(admitted.height, Some(1));
        assert!(fx.storage.contains(&base));
        assert_eq!(fx.accepted_log.view(), vec![base]);
        // Chain advanced and balances moved.
        assert_eq!(fx.chain.get_last_accepted(&sender).ordinal, 1);
        assert_eq!(fx.addresses.balance_of(&addr(0xEE)), 5);
        assert_eq!(fx.addresses.balance_of(&sender), -6);
    }

    #[tokio::test]
    async fn test_accept_missing_block() {
        let fx = fixture();
        let cache = CheckpointCache {
            block: None,
            height: None,
            children: Default::default(),
        };
        let result = fx.service.accept(cache, &[]).await;
        assert!(matches!(
            result,
            Err(AcceptanceError::MissingCheckpointBlock)
        ));
    }

    #[tokio::test]
    async fn test_accept_already_stored() {
        let fx = fixture();
        let block = block_over(&fx.parents, vec![]);

        fx.service
            .accept(CheckpointCache::new(block.clone()), &[])
            .await
            .unwrap();
        let result = fx.service.accept(CheckpointCache::new(block), &[]).await;
        assert!(matches!(result, Err(AcceptanceError::AlreadyStored(_))));
    }

    #[tokio::test]
    async fn test_accept_missing_parents() {
        let fx = fixture();
        let unknown = ParentRef {
            soe_hash: H256::from_bytes([0x99; 32]),
            base_hash: H256::from_bytes([0x9A; 32]),
        };
        let block = block_over(&[fx.parents[0], unknown], vec![]);

        let result = fx.service.accept(CheckpointCache::new(block), &[]).await;
        assert!(matches!(result, Err(AcceptanceError::MissingParents(_))));
    }

    #[tokio::test]
    async fn test_accept_conflicting_transaction() {
        let fx = fixture();
        let kp = Keypair::generate();
        let shared = signed_tx(&kp, 1, LastTransactionRef::genesis(&kp.address()));

        let first = block_over(&fx.parents, vec![shared.clone()]);
        fx.service
            .accept(CheckpointCache::new(first), &[])
            .await
            .unwrap();

        // A different block carrying the same transaction.
        let mut second = block_over(&fx.parents, vec![shared.clone()]);
        second.notifications.push(H256::from_bytes([0x42; 32]));

        let result = fx.service.accept(CheckpointCache::new(second), &[]).await;
        match result {
            Err(AcceptanceError::TipConflict { conflicting }) => {
                assert_eq!(conflicting, vec![shared.hash()]);
            }
            other => panic!("expected TipConflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_accept_broken_chain_rejected() {
        let fx = fixture();
        let kp = Keypair::generate();
        let stale = signed_tx(
            &kp,
            4,
            LastTransactionRef {
                hash: H256::from_bytes([7u8; 32]),
                ordinal: 3,
            },
        );
        let block = block_over(&fx.parents, vec![stale]);

        let result = fx.service.accept(CheckpointCache::new(block), &[]).await;
        assert!(matches!(
            result,
            Err(AcceptanceError::MissingTransactionReference(_))
        ));
    }

    #[tokio::test]
    async fn test_accept_wrong_parent_count() {
        let fx = fixture();
        let block = block_over(&fx.parents[..1], vec![]);
        let result = fx.service.accept(CheckpointCache::new(block), &[]).await;
        assert!(matches!(
            result,
            Err(AcceptanceError::ContainsInvalidTransactions { .. })
        ));
    }

    #[tokio::test]
    async fn test_unsigned_transaction_rejected() {
        // A peer strips the sender signature: the transfer must not clear
        // the gate.
        let fx = fixture();
        let kp = Keypair::generate();
        let mut forged = signed_tx(&kp, 1, LastTransactionRef::genesis(&kp.address()));
        forged.signature = polaris_crypto::Signature::ZERO;
        let block = block_over(&fx.parents, vec![forged.clone()]);

        let result = fx.service.accept(CheckpointCache::new(block), &[]).await;
        match result {
            Err(AcceptanceError::ContainsInvalidTransactions { invalid }) => {
                assert_eq!(invalid, vec![forged.hash()]);
            }
            other => panic!("expected ContainsInvalidTransactions, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forged_facilitator_signature_rejected() {
        // A signature entry claiming a facilitator without real signature
        // material fails block validation.
        let fx = fixture();
        let mut block = block_over(&fx.parents, vec![]);
        block.signatures.push(polaris_types::HashSignature {
            signer: node(9),
            signature: polaris_crypto::Signature::ZERO,
        });

        let result = fx.service.accept(CheckpointCache::new(block), &[]).await;
        assert!(matches!(
            result,
            Err(AcceptanceError::ContainsInvalidTransactions { .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_state_buffers() {
        let fx = fixture();
        fx.service
            .set_node_state(NodeState::DownloadCompleteAwaitingFinalSync);

        let block = block_over(&fx.parents, vec![]);
        let outcome = fx
            .service
            .accept(CheckpointCache::new(block.clone()), &[])
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert!(!fx.storage.contains(&block.base_hash()));

        let buffered = fx.service.drain_sync_buffer();
        assert_eq!(buffered.len(), 1);

        // Once ready, the buffered block goes through.
        fx.service.set_node_state(NodeState::Ready);
        fx.service
            .accept(buffered.into_iter().next().unwrap(), &[])
            .await
            .unwrap();
        assert!(fx.storage.contains(&block.base_hash()));
    }

    #[tokio::test]
    async fn test_parent_resolution_from_peer() {
        // Node B holds a block that node A needs as a parent; A resolves it
        // over the loopback network and accepts both.
        let storage_a = Arc::new(CheckpointStorage::new());
        let tips_a = Arc::new(TipService::new(
            TipServiceConfig::default(),
            Arc::clone(&storage_a),
        ));
        let network = LoopbackNetwork::new();

        // B's provider serves from its own storage.
        let storage_b = Arc::new(CheckpointStorage::new());
        struct Provider(Arc<CheckpointStorage>);
        impl polaris_network::CheckpointProvider for Provider {
            fn checkpoint(&self, soe_hash: &H256) -> Option<CheckpointCache> {
                self.0.lookup(soe_hash)
            }
        }
        let (_handle_b, _rx_b) =
            network.register(node(2), Some(Arc::new(Provider(Arc::clone(&storage_b)))));
        let (handle_a, _rx_a) = network.register(node(1), None);

        let service_a = Arc::new(AcceptanceService::new(
            AcceptanceConfig::default(),
            Arc::clone(&storage_a),
            tips_a,
            Arc::new(TransactionChainService::new()),
            Arc::new(AddressStore::new()),
            Arc::new(AcceptedLog::new()),
            Arc::new(handle_a),
            Arc::new(Metrics::new()),
        ));

        // Shared roots known to A.
        let mut roots = Vec::new();
        for marker in [1u8, 2] {
            let root = CheckpointBlock::new(
                vec![],
                vec![],
                vec![],
                vec![],
                vec![H256::from_bytes([marker; 32])],
            );
            let cache = CheckpointCache::with_height(root.clone(), 0);
            service_a.seed(cache.clone());
            storage_b.put(cache);
            roots.push(ParentRef {
                soe_hash: root.soe_hash(),
                base_hash: root.base_hash(),
            });
        }

        // The middle block lives only on B.
        let middle = CheckpointBlock::new(
            vec![],
            roots.clone(),
            vec![],
            vec![],
            vec![H256::from_bytes([0x33; 32])],
        );
        storage_b.put(CheckpointCache::with_height(middle.clone(), 1));

        // A receives a child of the middle block.
        let child = CheckpointBlock::new(
            vec![],
            vec![
                ParentRef {
                    soe_hash: middle.soe_hash(),
                    base_hash: middle.base_hash(),
                },
                roots[0],
            ],
            vec![],
            vec![],
            vec![H256::from_bytes([0x44; 32])],
        );

        let admitted = service_a
            .accept(CheckpointCache::new(child.clone()), &[node(2)])
            .await
            .unwrap()
            .unwrap();

        assert_eq!(admitted.height, Some(2));
        assert!(storage_a.contains(&middle.base_hash()));
        assert!(storage_a.contains(&child.base_hash()));
    }

    #[tokio::test]
    async fn test_conflict_race_under_lock() {
        // Two blocks with the same transaction race: exactly one wins, the
        // other fails with a conflict naming that transaction.
        let fx = fixture();
        let kp = Keypair::generate();
        let shared = signed_tx(&kp, 1, LastTransactionRef::genesis(&kp.address()));

        let mut a = block_over(&fx.parents, vec![shared.clone()]);
        a.notifications.push(H256::from_bytes([0xA1; 32]));
        let mut b = block_over(&fx.parents, vec![shared.clone()]);
        b.notifications.push(H256::from_bytes([0xB1; 32]));

        let service_a = Arc::clone(&fx.service);
        let service_b = Arc::clone(&fx.service);
        let task_a =
            tokio::spawn(async move { service_a.accept(CheckpointCache::new(a), &[]).await });
        let task_b =
            tokio::spawn(async move { service_b.accept(CheckpointCache::new(b), &[]).await });

        let results = [task_a.await.unwrap(), task_b.await.unwrap()];
        let accepted = results.iter().filter(|r| r.is_ok()).count();
        let conflicted = results
            .iter()
            .filter(|r| matches!(r, Err(AcceptanceError::TipConflict { .. })))
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(conflicted, 1);
        assert_eq!(fx.accepted_log.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_acceptance_not_reentrant() {
        let fx = fixture();
        let block = block_over(&fx.parents, vec![]);

        // After a completed accept the pending set is clean, so a second
        // call reports AlreadyStored, not PendingAcceptance.
        fx.service
            .accept(CheckpointCache::new(block.clone()), &[])
            .await
            .unwrap();
        let again = fx.service.accept(CheckpointCache::new(block), &[]).await;
        assert!(matches!(again, Err(AcceptanceError::AlreadyStored(_))));
    }
}
