//! Restoring node state from an external snapshot store

use crate::error::RollbackError;
use crate::service::SnapshotService;
use crate::store::SnapshotFileStore;
use async_trait::async_trait;
use polaris_core::AcceptanceService;
use polaris_primitives::{Address, Height, H256};
use polaris_types::{
    AddressCache, GenesisObservation, LastTransactionRef, SnapshotInfo, StoredSnapshot, TipData,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A remote (or remote-like) snapshot source, keyed by `<height>-<hash>`.
///
/// Raw bytes come back so the caller can pick the schema by height.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Read a stored snapshot's bytes
    async fn read_stored_snapshot(
        &self,
        height: Height,
        hash: H256,
    ) -> Result<Vec<u8>, RollbackError>;

    /// Read a snapshot info's bytes
    async fn read_snapshot_info(
        &self,
        height: Height,
        hash: H256,
    ) -> Result<Vec<u8>, RollbackError>;

    /// Read the genesis observation's bytes
    async fn read_genesis(&self) -> Result<Vec<u8>, RollbackError>;

    /// The highest `(height, hash)` this backend holds, if any
    async fn highest_snapshot(&self) -> Result<Option<(Height, H256)>, RollbackError>;
}

/// Backend over a local directory laid out like the cloud store:
/// `snapshot/<height>-<hash>`, `snapshot_info/<height>-<hash>`,
/// `genesis.json`.
pub struct DirectoryBackend {
    base_dir: PathBuf,
}

impl DirectoryBackend {
    /// Open a backend over a directory
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    fn object_name(height: Height, hash: H256) -> String {
        format!("{}-{}", height, hex::encode(hash.as_bytes()))
    }

    fn read_object(&self, dir: &str, name: &str) -> Result<Vec<u8>, RollbackError> {
        Ok(std::fs::read(self.base_dir.join(dir).join(name))?)
    }

    /// Write helpers used when publishing to the store
    pub fn write_snapshot(
        &self,
        height: Height,
        hash: H256,
        bytes: &[u8],
    ) -> Result<(), RollbackError> {
        let dir = self.base_dir.join("snapshot");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(Self::object_name(height, hash)), bytes)?;
        Ok(())
    }

    /// Publish a snapshot info object
    pub fn write_snapshot_info(
        &self,
        height: Height,
        hash: H256,
        bytes: &[u8],
    ) -> Result<(), RollbackError> {
        let dir = self.base_dir.join("snapshot_info");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(Self::object_name(height, hash)), bytes)?;
        Ok(())
    }

    /// Publish the genesis observation
    pub fn write_genesis(&self, bytes: &[u8]) -> Result<(), RollbackError> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::write(self.base_dir.join("genesis.json"), bytes)?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotBackend for DirectoryBackend {
    async fn read_stored_snapshot(
        &self,
        height: Height,
        hash: H256,
    ) -> Result<Vec<u8>, RollbackError> {
        self.read_object("snapshot", &Self::object_name(height, hash))
    }

    async fn read_snapshot_info(
        &self,
        height: Height,
        hash: H256,
    ) -> Result<Vec<u8>, RollbackError> {
        self.read_object("snapshot_info", &Self::object_name(height, hash))
    }

    async fn read_genesis(&self) -> Result<Vec<u8>, RollbackError> {
        Ok(std::fs::read(self.base_dir.join("genesis.json"))?)
    }

    async fn highest_snapshot(&self) -> Result<Option<(Height, H256)>, RollbackError> {
        let dir = self.base_dir.join("snapshot");
        if !dir.exists() {
            return Ok(None);
        }
        let mut best: Option<(Height, H256)> = None;
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            let Some((height_part, hash_part)) = name.split_once('-') else {
                continue;
            };
            let (Ok(height), Ok(hash)) =
                (height_part.parse::<Height>(), H256::from_hex(hash_part))
            else {
                continue;
            };
            if best.map(|(h, _)| height > h).unwrap_or(true) {
                best = Some((height, hash));
            }
        }
        Ok(best)
    }
}

/// The legacy V1 on-disk shape: balances only, no snapshot-hash chain.
#[derive(Debug, Deserialize)]
struct SnapshotInfoV1 {
    snapshot: StoredSnapshot,
    accepted_cbs_since_snapshot: Vec<H256>,
    last_snapshot_height: Height,
    address_balances: HashMap<Address, i128>,
    tips: HashMap<H256, TipData>,
    last_accepted_tx_ref: HashMap<Address, LastTransactionRef>,
}

impl SnapshotInfoV1 {
    fn migrate(self) -> SnapshotInfo {
        let address_cache = self
            .address_balances
            .into_iter()
            .map(|(address, balance)| {
                (
                    address,
                    AddressCache {
                        balance,
                        reputation: None,
                    },
                )
            })
            .collect();
        let snapshot_hashes = vec![self.snapshot.snapshot.hash()];
        SnapshotInfo {
            snapshot: self.snapshot,
            accepted_cbs_since_snapshot: self.accepted_cbs_since_snapshot,
            last_snapshot_height: self.last_snapshot_height,
            snapshot_hashes,
            address_cache,
            tips: self.tips,
            last_accepted_tx_ref: self.last_accepted_tx_ref,
        }
    }
}

/// Where to roll back to
#[derive(Debug, Clone, Copy)]
pub enum RollbackTarget {
    /// A specific sealed state
    At {
        /// Snapshot height
        height: Height,
        /// Snapshot hash
        hash: H256,
    },
    /// Whatever the backends hold as highest
    Highest,
}

/// Rollback tuning
#[derive(Debug, Clone, Default)]
pub struct RollbackConfig {
    /// Heights at or below this deserialize with the V1 schema
    pub v1_max_height: Height,
}

/// Restores node state from one of N ordered backends at `(height, hash)`.
pub struct RollbackService {
    config: RollbackConfig,
    backends: Vec<Arc<dyn SnapshotBackend>>,
    snapshot_service: Arc<SnapshotService>,
    acceptance: Arc<AcceptanceService>,
    local_store: Arc<SnapshotFileStore>,
    participated: AtomicBool,
}

impl RollbackService {
    /// Wire up the service over ordered backends (head tried first)
    pub fn new(
        config: RollbackConfig,
        backends: Vec<Arc<dyn SnapshotBackend>>,
        snapshot_service: Arc<SnapshotService>,
        acceptance: Arc<AcceptanceService>,
        local_store: Arc<SnapshotFileStore>,
    ) -> Self {
        Self {
            config,
            backends,
            snapshot_service,
            acceptance,
            local_store,
            participated: AtomicBool::new(false),
        }
    }

    /// Whether this node has restored from a rollback
    pub fn participated_in_rollback(&self) -> bool {
        self.participated.load(Ordering::SeqCst)
    }

    /// Restore the node to the target state. Returns the `(height, hash)`
    /// actually restored.
    pub async fn rollback(&self, target: RollbackTarget) -> Result<(Height, H256), RollbackError> {
        let (height, hash) = match target {
            RollbackTarget::At { height, hash } => (height, hash),
            RollbackTarget::Highest => self
                .find_highest()
                .await?
                .ok_or(RollbackError::NothingToRestore)?,
        };
        tracing::info!(height, %hash, "rolling back node state");

        let stored_bytes = self
            .with_failover(|b| async move { b.read_stored_snapshot(height, hash).await })
            .await
            .ok_or(RollbackError::BackendUnavailable { height, hash })?;
        let info_bytes = self
            .with_failover(|b| async move { b.read_snapshot_info(height, hash).await })
            .await
            .ok_or(RollbackError::BackendUnavailable { height, hash })?;
        let genesis_bytes = self
            .with_failover(|b| async move { b.read_genesis().await })
            .await
            .ok_or(RollbackError::BackendUnavailable { height, hash })?;

        let stored: StoredSnapshot = serde_json::from_slice(&stored_bytes)?;
        let info: SnapshotInfo = if height <= self.config.v1_max_height {
            let v1: SnapshotInfoV1 = serde_json::from_slice(&info_bytes)
                .map_err(|e| RollbackError::Migration(e.to_string()))?;
            v1.migrate()
        } else {
            serde_json::from_slice(&info_bytes)?
        };
        let genesis: GenesisObservation = serde_json::from_slice(&genesis_bytes)?;

        // No negative balances may enter the restored state.
        for (address, cache) in &info.address_cache {
            if cache.balance < 0 {
                return Err(RollbackError::InvalidBalances { address: *address });
            }
        }

        // Apply.
        self.participated.store(true, Ordering::SeqCst);
        self.accept_genesis(&genesis);
        self.snapshot_service.restore(&info);
        self.snapshot_service.reseed_caches(&info.snapshot.checkpoint_cache);

        self.local_store
            .write_snapshot(&hash, &stored)
            .map_err(|e| RollbackError::Migration(e.to_string()))?;
        self.local_store
            .write_snapshot_info(&hash, &info)
            .map_err(|e| RollbackError::Migration(e.to_string()))?;
        self.snapshot_service
            .persist_majority_marker(height, hash)
            .map_err(|e| RollbackError::Migration(e.to_string()))?;

        tracing::info!(height, %hash, "rollback complete");
        Ok((height, hash))
    }

    /// Seed the genesis observation's blocks into the DAG
    fn accept_genesis(&self, genesis: &GenesisObservation) {
        use polaris_types::CheckpointCache;
        self.acceptance
            .seed(CheckpointCache::with_height(genesis.genesis.clone(), 0));
        self.acceptance.seed(CheckpointCache::with_height(
            genesis.initial_distribution.clone(),
            1,
        ));
        self.acceptance.seed(CheckpointCache::with_height(
            genesis.initial_distribution2.clone(),
            1,
        ));
    }

    async fn find_highest(&self) -> Result<Option<(Height, H256)>, RollbackError> {
        for backend in &self.backends {
            match backend.highest_snapshot().await {
                Ok(Some(found)) => return Ok(Some(found)),
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "backend failed while finding highest");
                }
            }
        }
        Ok(None)
    }

    /// Try each backend in order (head, then tail) until one answers.
    async fn with_failover<F, Fut>(&self, op: F) -> Option<Vec<u8>>
    where
        F: Fn(Arc<dyn SnapshotBackend>) -> Fut,
        Fut: std::future::Future<Output = Result<Vec<u8>, RollbackError>>,
    {
        for backend in &self.backends {
            match op(Arc::clone(backend)).await {
                Ok(bytes) => return Some(bytes),
                Err(err) => {
                    tracing::warn!(error = %err, "snapshot backend failed, trying next");
                }
            }
        }
        None
    }
}
