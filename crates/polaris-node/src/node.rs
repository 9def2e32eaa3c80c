//! Node orchestration for polaris-node

use crate::config::NodeConfig;
use crate::genesis::GenesisBuilder;
use polaris_consensus::ConsensusManager;
use polaris_core::AcceptanceService;
use polaris_crypto::Keypair;
use polaris_mempool::{PendingObservations, PendingTransactions, TransactionChainService};
use polaris_metrics::Metrics;
use polaris_network::{LoopbackNetwork, PeerClient, PeerMessage};
use polaris_primitives::{NodeId, H256};
use polaris_snapshot::{
    DirectoryBackend, RollbackService, RollbackTarget, SnapshotBackend, SnapshotError,
    SnapshotFileStore, SnapshotService,
};
use polaris_storage::{
    AcceptedLog, AddressStore, CheckpointStorage, NodeReputationStore, TipService,
    TipServiceConfig,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

/// Node error types
#[derive(Debug, Error)]
pub enum NodeError {
    /// Genesis error
    #[error("genesis error: {0}")]
    Genesis(#[from] crate::genesis::GenesisError),
    /// Snapshot store error
    #[error("snapshot store error: {0}")]
    Snapshot(#[from] polaris_snapshot::SnapshotError),
    /// Rollback error
    #[error("rollback error: {0}")]
    Rollback(#[from] polaris_snapshot::RollbackError),
    /// Crypto error
    #[error("crypto error: {0}")]
    Crypto(#[from] polaris_crypto::CryptoError),
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;

/// A fully wired Polaris node
pub struct Node {
    config: NodeConfig,
    node_id: NodeId,
    consensus: Arc<ConsensusManager>,
    snapshot: Arc<SnapshotService>,
    rollback: Arc<RollbackService>,
    acceptance: Arc<AcceptanceService>,
    tips: Arc<TipService>,
    transactions_pool: Arc<PendingTransactions>,
    observations_pool: Arc<PendingObservations>,
    metrics: Arc<Metrics>,
    inbox: mpsc::UnboundedReceiver<(NodeId, PeerMessage)>,
    known_peers: BTreeSet<NodeId>,
}

impl Node {
    /// Assemble a node over an in-process network.
    ///
    /// A production deployment swaps the loopback for a real transport
    /// behind the same [`PeerClient`] seam.
    pub fn new(config: NodeConfig, network: &Arc<LoopbackNetwork>) -> NodeResult<Self> {
        std::fs::create_dir_all(&config.datadir)?;

        let keypair = match &config.private_key {
            Some(raw) => {
                let bytes = hex::decode(raw.strip_prefix("0x").unwrap_or(raw))
                    .map_err(|e| NodeError::Config(format!("private_key: {e}")))?;
                let bytes: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| NodeError::Config("private_key must be 32 bytes".into()))?;
                Keypair::from_private_bytes(&bytes)?
            }
            None => Keypair::generate(),
        };
        let keypair = Arc::new(keypair);
        let node_id = keypair.node_id();

        let storage = Arc::new(CheckpointStorage::new());
        let tips = Arc::new(TipService::new(
            TipServiceConfig::default(),
            Arc::clone(&storage),
        ));
        let chain = Arc::new(TransactionChainService::new());
        let addresses = Arc::new(AddressStore::new());
        let reputation = Arc::new(NodeReputationStore::new());
        let accepted_log = Arc::new(AcceptedLog::new());
        let transactions_pool = Arc::new(PendingTransactions::new(Arc::clone(&chain)));
        let observations_pool = Arc::new(PendingObservations::new());
        let metrics = Arc::new(Metrics::new());

        struct Provider(Arc<CheckpointStorage>);
        impl polaris_network::CheckpointProvider for Provider {
            fn checkpoint(&self, soe_hash: &H256) -> Option<polaris_types::CheckpointCache> {
                self.0.lookup(soe_hash)
            }
        }
        let (handle, inbox) =
            network.register(node_id, Some(Arc::new(Provider(Arc::clone(&storage)))));
        let peers: Arc<dyn PeerClient> = Arc::new(handle);

        let acceptance = Arc::new(AcceptanceService::new(
            config.acceptance_config(),
            Arc::clone(&storage),
            Arc::clone(&tips),
            Arc::clone(&chain),
            Arc::clone(&addresses),
            Arc::clone(&accepted_log),
            Arc::clone(&peers),
            Arc::clone(&metrics),
        ));

        let consensus = ConsensusManager::new(
            node_id,
            Arc::clone(&keypair),
            config.consensus_manager_config(),
            Arc::clone(&peers),
            Arc::clone(&storage),
            Arc::clone(&tips),
            Arc::clone(&chain),
            Arc::clone(&transactions_pool),
            Arc::clone(&observations_pool),
            Arc::clone(&acceptance),
            Arc::clone(&metrics),
        );

        let file_store = Arc::new(SnapshotFileStore::new(config.datadir.join("snapshots"))?);
        let snapshot_config = config
            .snapshot_config()
            .map_err(|e| NodeError::Config(e.to_string()))?;
        let snapshot = Arc::new(SnapshotService::new(
            node_id,
            Arc::clone(&keypair),
            snapshot_config,
            Arc::clone(&storage),
            Arc::clone(&tips),
            Arc::clone(&addresses),
            Arc::clone(&reputation),
            Arc::clone(&chain),
            Arc::clone(&accepted_log),
            Arc::clone(&acceptance),
            Arc::clone(&observations_pool),
            Arc::clone(&file_store),
            Arc::clone(&metrics),
        ));

        let backends: Vec<Arc<dyn SnapshotBackend>> = if config.storage.enabled {
            config
                .storage
                .backends
                .iter()
                .map(|path| Arc::new(DirectoryBackend::new(path)) as Arc<dyn SnapshotBackend>)
                .collect()
        } else {
            Vec::new()
        };
        let rollback = Arc::new(RollbackService::new(
            config.rollback_config(),
            backends,
            Arc::clone(&snapshot),
            Arc::clone(&acceptance),
            Arc::clone(&file_store),
        ));

        // Fresh nodes bootstrap a genesis DAG.
        if storage.is_empty() {
            let alloc = config
                .genesis_alloc()
                .map_err(|e| NodeError::Config(e.to_string()))?;
            let builder = GenesisBuilder::new(alloc);
            let observation = builder.build();
            builder.apply(&observation, &acceptance, &tips, &addresses)?;
        }

        Ok(Self {
            config,
            node_id,
            consensus,
            snapshot,
            rollback,
            acceptance,
            tips,
            transactions_pool,
            observations_pool,
            metrics,
            inbox,
            known_peers: BTreeSet::new(),
        })
    }

    /// This node's identity
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The pending transaction pool
    pub fn transactions_pool(&self) -> &Arc<PendingTransactions> {
        &self.transactions_pool
    }

    /// The pending observation pool
    pub fn observations_pool(&self) -> &Arc<PendingObservations> {
        &self.observations_pool
    }

    /// The acceptance pipeline
    pub fn acceptance(&self) -> &Arc<AcceptanceService> {
        &self.acceptance
    }

    /// The snapshot service
    pub fn snapshot(&self) -> &Arc<SnapshotService> {
        &self.snapshot
    }

    /// The rollback service
    pub fn rollback_service(&self) -> &Arc<RollbackService> {
        &self.rollback
    }

    /// The metrics registry
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Peers this node will facilitate rounds with
    pub fn set_known_peers(&mut self, peers: BTreeSet<NodeId>) {
        self.known_peers = peers;
    }

    /// Restore node state before starting
    pub async fn run_rollback(&self, target: RollbackTarget) -> NodeResult<()> {
        let (height, hash) = self.rollback.rollback(target).await?;
        tracing::info!(height, %hash, "node restored from rollback");
        Ok(())
    }

    /// Run the node until the shutdown signal fires.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        tracing::info!(node_id = %self.node_id, "starting polaris node");
        tracing::info!(datadir = ?self.config.datadir, "data directory");

        let mut inbox = self.inbox;
        let mut round_tick =
            interval(Duration::from_millis(self.config.consensus.round_trigger_ms));
        let mut snapshot_tick =
            interval(Duration::from_millis(self.config.snapshot.snapshot_trigger_ms));

        loop {
            tokio::select! {
                Some((from, message)) = inbox.recv() => {
                    self.consensus.handle_message(from, message).await;
                }
                _ = round_tick.tick() => {
                    self.metrics.gauge(
                        "mempool.pending_transactions",
                        self.transactions_pool.len() as i64,
                    );
                    self.metrics.gauge(
                        "mempool.pending_observations",
                        self.observations_pool.len() as i64,
                    );
                    self.metrics.gauge("storage.tips", self.tips.len() as i64);

                    if !self.known_peers.is_empty() {
                        if let Err(err) =
                            self.consensus.start_own_round(&self.known_peers).await
                        {
                            tracing::warn!(error = %err, "failed to start round");
                        }
                    }
                }
                _ = snapshot_tick.tick() => {
                    match self.snapshot.attempt_snapshot().await {
                        Ok(hash) => tracing::info!(%hash, "snapshot written"),
                        // Unmet preconditions retry on the next tick.
                        Err(SnapshotError::Io(err)) => {
                            tracing::error!(error = %err, "snapshot io failure");
                        }
                        Err(err) => tracing::debug!(reason = %err, "snapshot not due"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.consensus.shutdown().await;
        tracing::info!("polaris node stopped");
    }
}
