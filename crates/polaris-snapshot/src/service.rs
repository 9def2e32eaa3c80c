//! Interval sealing: turning accepted checkpoints into snapshots

use crate::error::{SnapshotError, SnapshotResult};
use crate::store::{MajorityMarker, SnapshotFileStore};
use parking_lot::Mutex;
use polaris_core::AcceptanceService;
use polaris_crypto::Keypair;
use polaris_mempool::{PendingObservations, TransactionChainService};
use polaris_metrics::Metrics;
use polaris_primitives::{Height, NodeId, H256};
use polaris_storage::{
    AcceptedLog, AddressStore, CheckpointStorage, NodeReputationStore, TipService,
};
use polaris_types::{
    ActiveNodes, CheckpointCache, Observation, ObservationEvent, Snapshot, SnapshotInfo,
    StoredSnapshot,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// The height window in which this node counts as active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActiveBetweenHeights {
    /// Height the node joined at
    pub joined: Height,
    /// Height the node left at, when it has left
    pub left: Option<Height>,
}

/// Snapshot service tuning
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Heights sealed per snapshot
    pub snapshot_height_interval: Height,
    /// Required lead of the minimum tip height past the seal point
    pub snapshot_height_delay_interval: Height,
    /// Recompute the active pool every this many snapshot intervals
    pub active_peers_rotation_interval: Height,
    /// Self-healing cap on the accepted-block log
    pub max_accepted_cb_hashes_in_memory: usize,
    /// Disk limit for stored snapshots, in bytes; `0` disables
    pub size_disk_limit: u64,
    /// Minimum usable disk space to attempt a snapshot, in bytes
    pub min_usable_space: u64,
    /// Active-pool size selected at rotation
    pub active_pool_size: usize,
    /// Full nodes active before the first rotation
    pub initial_active_full_nodes: BTreeSet<NodeId>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            snapshot_height_interval: 2,
            snapshot_height_delay_interval: 4,
            active_peers_rotation_interval: 10,
            max_accepted_cb_hashes_in_memory: 4_000,
            size_disk_limit: 0,
            min_usable_space: 1 << 30,
            active_pool_size: 3,
            initial_active_full_nodes: BTreeSet::new(),
        }
    }
}

/// Seals height intervals of the accepted DAG into snapshots and writes
/// them to disk.
///
/// A per-service semaphore keeps attempts sequential; the acceptance lock
/// is re-acquired over the commit so no admission straddles the seal.
pub struct SnapshotService {
    node_id: NodeId,
    keypair: Arc<Keypair>,
    config: SnapshotConfig,
    storage: Arc<CheckpointStorage>,
    tips: Arc<TipService>,
    addresses: Arc<AddressStore>,
    reputation: Arc<NodeReputationStore>,
    chain: Arc<TransactionChainService>,
    accepted_log: Arc<AcceptedLog>,
    acceptance: Arc<AcceptanceService>,
    observations_pool: Arc<PendingObservations>,
    store: Arc<SnapshotFileStore>,
    metrics: Arc<Metrics>,
    semaphore: tokio::sync::Mutex<()>,
    stored: Mutex<StoredSnapshot>,
    snapshot_hashes: Mutex<Vec<H256>>,
    last_snapshot_height: AtomicU64,
    active_between: Mutex<ActiveBetweenHeights>,
    known_full_peers: Mutex<BTreeSet<NodeId>>,
    known_light_peers: Mutex<BTreeSet<NodeId>>,
}

impl SnapshotService {
    /// Wire up the service, starting from the zero snapshot
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        keypair: Arc<Keypair>,
        config: SnapshotConfig,
        storage: Arc<CheckpointStorage>,
        tips: Arc<TipService>,
        addresses: Arc<AddressStore>,
        reputation: Arc<NodeReputationStore>,
        chain: Arc<TransactionChainService>,
        accepted_log: Arc<AcceptedLog>,
        acceptance: Arc<AcceptanceService>,
        observations_pool: Arc<PendingObservations>,
        store: Arc<SnapshotFileStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            node_id,
            keypair,
            config,
            storage,
            tips,
            addresses,
            reputation,
            chain,
            accepted_log,
            acceptance,
            observations_pool,
            store,
            metrics,
            semaphore: tokio::sync::Mutex::new(()),
            stored: Mutex::new(StoredSnapshot {
                snapshot: Snapshot::zero(),
                checkpoint_cache: vec![],
            }),
            snapshot_hashes: Mutex::new(Vec::new()),
            last_snapshot_height: AtomicU64::new(0),
            active_between: Mutex::new(ActiveBetweenHeights::default()),
            known_full_peers: Mutex::new(BTreeSet::new()),
            known_light_peers: Mutex::new(BTreeSet::new()),
        }
    }

    /// Height the last snapshot sealed at
    pub fn last_snapshot_height(&self) -> Height {
        self.last_snapshot_height.load(Ordering::SeqCst)
    }

    /// The last stored snapshot
    pub fn stored_snapshot(&self) -> StoredSnapshot {
        self.stored.lock().clone()
    }

    /// Hashes of all snapshots taken so far
    pub fn snapshot_hashes(&self) -> Vec<H256> {
        self.snapshot_hashes.lock().clone()
    }

    /// Window in which this node counts as active
    pub fn active_between(&self) -> ActiveBetweenHeights {
        *self.active_between.lock()
    }

    /// Set the active window (join, rollback restore)
    pub fn set_active_between(&self, window: ActiveBetweenHeights) {
        *self.active_between.lock() = window;
    }

    /// Update the peer sets used for rotation and pool observations
    pub fn set_known_peers(&self, full: BTreeSet<NodeId>, light: BTreeSet<NodeId>) {
        *self.known_full_peers.lock() = full;
        *self.known_light_peers.lock() = light;
    }

    /// Attempt to seal the next height interval.
    ///
    /// Preconditions fail fast with typed errors and no side effects (the
    /// log trim excepted); on success every in-memory mutation lands only
    /// after both artifact files are written.
    pub async fn attempt_snapshot(&self) -> SnapshotResult<H256> {
        let _sem = self.semaphore.lock().await;
        self.metrics.counter("snapshot.attempts", 1);

        let last_height = self.last_snapshot_height();
        let next_height = last_height + self.config.snapshot_height_interval;

        // 1. Active-pool membership under the last stored snapshot.
        let (prev_snapshot, prev_hash, membership) = {
            let stored = self.stored.lock();
            let membership = if stored.snapshot.is_zero() {
                self.config.initial_active_full_nodes.clone()
            } else {
                stored.snapshot.next_active_nodes.full.clone()
            };
            (stored.snapshot.clone(), stored.snapshot.hash(), membership)
        };
        if !membership.contains(&self.node_id) {
            return Err(SnapshotError::NodeNotInActivePool);
        }

        // 2. The node must have been active across the interval.
        let window = self.active_between();
        let within = window.joined <= next_height
            && window.left.map_or(true, |left| next_height <= left);
        if !within {
            return Err(SnapshotError::ActiveBetweenHeightsConditionNotMet { next_height });
        }

        // 3. Disk headroom.
        let available = self.store.usable_space()?;
        if available < self.config.min_usable_space {
            return Err(SnapshotError::NotEnoughSpace {
                available,
                required: self.config.min_usable_space,
            });
        }

        // 4. Self-healing overflow trim.
        let log_len = self.accepted_log.len();
        if log_len > self.config.max_accepted_cb_hashes_in_memory {
            self.accepted_log.truncate(100);
            return Err(SnapshotError::MaxCbHashesInMemory { count: log_len });
        }

        // 5. Something must have been accepted.
        if self.accepted_log.is_empty() {
            return Err(SnapshotError::NoAcceptedCbsSinceSnapshot);
        }

        // 6. The DAG must have advanced past the seal point.
        let required = next_height + self.config.snapshot_height_delay_interval;
        let min_tip_height = self.tips.min_tip_height();
        if !matches!(min_tip_height, Some(h) if h > required) {
            return Err(SnapshotError::HeightIntervalConditionNotMet {
                min_tip_height,
                required,
            });
        }

        // 7. The interval itself must be non-empty.
        let mut all_blocks = self
            .storage
            .blocks_in_height_interval(last_height, next_height);
        if all_blocks.is_empty() {
            return Err(SnapshotError::NoBlocksWithinHeightInterval);
        }
        all_blocks.sort_by_key(|c| c.base_hash());
        let sealed_hashes: Vec<H256> = all_blocks
            .iter()
            .map(|c| {
                c.base_hash()
                    .ok_or_else(|| SnapshotError::IllegalState("cache without block".into()))
            })
            .collect::<SnapshotResult<_>>()?;

        // Sealing starts: block admissions so no block lands half in, half
        // out of the interval.
        let _admissions = self.acceptance.lock_admissions().await;
        let start = Instant::now();

        let next_active = self.next_active_nodes(&prev_snapshot, next_height, &membership);
        let next_snapshot = Snapshot {
            last_snapshot: prev_hash,
            checkpoint_blocks: sealed_hashes.clone(),
            public_reputation: self.reputation.export(),
            next_active_nodes: next_active.clone(),
        };
        let next_hash = next_snapshot.hash();
        let next_stored = StoredSnapshot {
            snapshot: next_snapshot,
            checkpoint_cache: all_blocks.clone(),
        };

        // Capture the post-seal resumable state and write both artifacts
        // before mutating anything in memory.
        let mut remaining = self.accepted_log.view();
        remaining.retain(|h| !sealed_hashes.contains(h));
        let mut snapshot_hashes = self.snapshot_hashes();
        snapshot_hashes.push(next_hash);
        let info = SnapshotInfo {
            snapshot: next_stored.clone(),
            accepted_cbs_since_snapshot: remaining,
            last_snapshot_height: next_height,
            snapshot_hashes: snapshot_hashes.clone(),
            address_cache: self.addresses.export(),
            tips: self.tips.export(),
            last_accepted_tx_ref: self.chain.export(),
        };
        self.write_with_retries(&next_hash, &next_stored, &info)?;

        // Commit the seal.
        self.storage.increment_total_accepted(all_blocks.len() as u64);
        self.storage.batch_remove(&sealed_hashes);
        *self.stored.lock() = next_stored;
        self.last_snapshot_height
            .store(next_height, Ordering::SeqCst);
        self.accepted_log.remove(&sealed_hashes);
        *self.snapshot_hashes.lock() = snapshot_hashes;

        self.emit_pool_observations(&next_active);

        self.metrics.counter("snapshot.written", 1);
        self.metrics
            .histogram("snapshot.write_ms", start.elapsed().as_millis() as f64);
        tracing::info!(
            snapshot = %next_hash,
            sealed = sealed_hashes.len(),
            height = next_height,
            "snapshot sealed"
        );
        Ok(next_hash)
    }

    /// Active pool for the next epoch: rotate from reputation every N
    /// intervals, bootstrap from config after the zero snapshot, carry
    /// forward otherwise.
    fn next_active_nodes(
        &self,
        prev: &Snapshot,
        next_height: Height,
        membership: &BTreeSet<NodeId>,
    ) -> ActiveNodes {
        let rotation_every =
            self.config.snapshot_height_interval * self.config.active_peers_rotation_interval;
        if rotation_every > 0 && next_height % rotation_every == 0 {
            let full_candidates: Vec<NodeId> = membership
                .iter()
                .chain(self.known_full_peers.lock().iter())
                .copied()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let light_candidates: Vec<NodeId> = prev
                .next_active_nodes
                .light
                .iter()
                .chain(self.known_light_peers.lock().iter())
                .copied()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            ActiveNodes {
                full: self
                    .reputation
                    .top_k_among(&full_candidates, self.config.active_pool_size)
                    .into_iter()
                    .collect(),
                light: self
                    .reputation
                    .top_k_among(&light_candidates, self.config.active_pool_size)
                    .into_iter()
                    .collect(),
            }
        } else if prev.is_zero() {
            ActiveNodes {
                full: self.config.initial_active_full_nodes.clone(),
                light: BTreeSet::new(),
            }
        } else {
            prev.next_active_nodes.clone()
        }
    }

    /// Write both artifacts, retrying up to 3 times and deleting old
    /// snapshots between attempts when disk pressure is the cause.
    fn write_with_retries(
        &self,
        hash: &H256,
        stored: &StoredSnapshot,
        info: &SnapshotInfo,
    ) -> SnapshotResult<()> {
        let approx_size = serde_json::to_vec(stored)?.len() as u64;
        let mut last_err: Option<SnapshotError> = None;

        for attempt in 0..3 {
            if self
                .store
                .would_exceed_limit(self.config.size_disk_limit, approx_size)?
            {
                if !self.store.delete_oldest()? {
                    last_err = Some(SnapshotError::NotEnoughSpace {
                        available: 0,
                        required: approx_size,
                    });
                    continue;
                }
            }

            match self
                .store
                .write_snapshot(hash, stored)
                .and_then(|_| self.store.write_snapshot_info(hash, info))
            {
                Ok(()) => return Ok(()),
                Err(err) => {
                    self.metrics.counter("snapshot.io_failures", 1);
                    tracing::warn!(attempt, error = %err, "snapshot write failed");
                    let _ = self.store.delete_oldest();
                    last_err = Some(err);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| SnapshotError::IllegalState("write retries exhausted".into())))
    }

    /// Observe every known peer's pool membership under the new epoch
    fn emit_pool_observations(&self, next_active: &ActiveNodes) {
        let epoch_seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut leavers = Vec::new();
        let known: Vec<NodeId> = {
            let full = self.known_full_peers.lock();
            let light = self.known_light_peers.lock();
            full.iter().chain(light.iter()).copied().collect()
        };

        for peer in known {
            let member =
                next_active.full.contains(&peer) || next_active.light.contains(&peer);
            let event = if member {
                ObservationEvent::NodeMemberOfActivePool
            } else {
                leavers.push(peer);
                ObservationEvent::NodeNotMemberOfActivePool
            };
            match Observation::new(&self.keypair, peer, event, epoch_seconds) {
                Ok(obs) => self.observations_pool.put(obs),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to sign pool observation")
                }
            }
        }

        // Leaving peers drop out of the known sets.
        if !leavers.is_empty() {
            let mut full = self.known_full_peers.lock();
            let mut light = self.known_light_peers.lock();
            for peer in &leavers {
                full.remove(peer);
                light.remove(peer);
            }
            tracing::info!(count = leavers.len(), "marked leaving peers offline");
        }
    }

    /// Replace the whole snapshot state from a restored [`SnapshotInfo`]
    /// (rollback, startup resume).
    pub fn restore(&self, info: &SnapshotInfo) {
        *self.stored.lock() = info.snapshot.clone();
        self.last_snapshot_height
            .store(info.last_snapshot_height, Ordering::SeqCst);
        *self.snapshot_hashes.lock() = info.snapshot_hashes.clone();
        self.accepted_log
            .restore(info.accepted_cbs_since_snapshot.clone());
        self.addresses.restore(info.address_cache.clone());
        self.tips.restore(info.tips.clone());
        self.chain.restore(info.last_accepted_tx_ref.clone());
        self.set_active_between(ActiveBetweenHeights {
            joined: info
                .last_snapshot_height
                .saturating_sub(self.config.snapshot_height_interval),
            left: None,
        });
    }

    /// Write the last-majority marker after a restore
    pub fn persist_majority_marker(&self, height: Height, hash: H256) -> SnapshotResult<()> {
        self.store
            .write_majority_marker(MajorityMarker { height, hash })
    }

    /// Seed the sealed-block caches of a restored snapshot back into the
    /// DAG-facing state (used by rollback before replaying the log).
    pub fn reseed_caches(&self, caches: &[CheckpointCache]) {
        for cache in caches {
            self.acceptance.seed(cache.clone());
        }
    }
}
