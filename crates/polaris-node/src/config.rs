//! Configuration types for polaris-node

use polaris_consensus::{ConsensusManagerConfig, RoundConfig};
use polaris_core::AcceptanceConfig;
use polaris_primitives::{Address, Height, NodeId};
use polaris_snapshot::{RollbackConfig, SnapshotConfig};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

/// Node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory
    #[serde(default = "default_datadir")]
    pub datadir: PathBuf,
    /// Hex-encoded node private key; generated fresh when absent
    #[serde(default)]
    pub private_key: Option<String>,
    /// Consensus settings
    #[serde(default)]
    pub consensus: ConsensusSection,
    /// Snapshot settings
    #[serde(default)]
    pub snapshot: SnapshotSection,
    /// Persisted-schema settings
    #[serde(default)]
    pub schema: SchemaSection,
    /// Cloud off-load settings
    #[serde(default)]
    pub storage: StorageSection,
    /// Genesis settings
    #[serde(default)]
    pub genesis: GenesisSection,
}

fn default_datadir() -> PathBuf {
    PathBuf::from("./data")
}

/// Consensus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSection {
    /// Phase-1 transaction cap
    #[serde(default = "default_max_transaction_threshold")]
    pub max_transaction_threshold: usize,
    /// Phase-1 observation cap
    #[serde(default = "default_max_observation_threshold")]
    pub max_observation_threshold: usize,
    /// Per-stage timeout, in milliseconds
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    /// Whole-round timeout, in milliseconds
    #[serde(default = "default_round_timeout_ms")]
    pub round_timeout_ms: u64,
    /// Maximum rounds run in parallel
    #[serde(default = "default_max_parallel_rounds")]
    pub max_parallel_rounds: usize,
    /// Cooldown between own rounds, in milliseconds
    #[serde(default = "default_round_cooldown_ms")]
    pub round_cooldown_ms: u64,
    /// Peer parent-resolution timeout, in milliseconds
    #[serde(default = "default_resolution_timeout_ms")]
    pub resolution_timeout_ms: u64,
    /// How often the node tries to open a round, in milliseconds
    #[serde(default = "default_round_trigger_ms")]
    pub round_trigger_ms: u64,
}

fn default_max_transaction_threshold() -> usize {
    50
}
fn default_max_observation_threshold() -> usize {
    50
}
fn default_stage_timeout_ms() -> u64 {
    10_000
}
fn default_round_timeout_ms() -> u64 {
    30_000
}
fn default_max_parallel_rounds() -> usize {
    3
}
fn default_round_cooldown_ms() -> u64 {
    1_000
}
fn default_resolution_timeout_ms() -> u64 {
    15_000
}
fn default_round_trigger_ms() -> u64 {
    2_000
}

impl Default for ConsensusSection {
    fn default() -> Self {
        Self {
            max_transaction_threshold: default_max_transaction_threshold(),
            max_observation_threshold: default_max_observation_threshold(),
            stage_timeout_ms: default_stage_timeout_ms(),
            round_timeout_ms: default_round_timeout_ms(),
            max_parallel_rounds: default_max_parallel_rounds(),
            round_cooldown_ms: default_round_cooldown_ms(),
            resolution_timeout_ms: default_resolution_timeout_ms(),
            round_trigger_ms: default_round_trigger_ms(),
        }
    }
}

/// Snapshot settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSection {
    /// Heights sealed per snapshot
    #[serde(default = "default_snapshot_height_interval")]
    pub snapshot_height_interval: Height,
    /// Required tip-height lead past the seal point
    #[serde(default = "default_snapshot_height_delay_interval")]
    pub snapshot_height_delay_interval: Height,
    /// Rotate the active pool every this many snapshot intervals
    #[serde(default = "default_active_peers_rotation_interval")]
    pub active_peers_rotation_interval: Height,
    /// Disk limit for stored snapshots, in bytes; `0` disables
    #[serde(default)]
    pub size_disk_limit: u64,
    /// How often the node attempts a snapshot, in milliseconds
    #[serde(default = "default_snapshot_trigger_ms")]
    pub snapshot_trigger_ms: u64,
    /// Full nodes active before the first rotation, by hex id
    #[serde(default)]
    pub initial_active_full_nodes: Vec<String>,
}

fn default_snapshot_height_interval() -> Height {
    2
}
fn default_snapshot_height_delay_interval() -> Height {
    4
}
fn default_active_peers_rotation_interval() -> Height {
    10
}
fn default_snapshot_trigger_ms() -> u64 {
    5_000
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            snapshot_height_interval: default_snapshot_height_interval(),
            snapshot_height_delay_interval: default_snapshot_height_delay_interval(),
            active_peers_rotation_interval: default_active_peers_rotation_interval(),
            size_disk_limit: 0,
            snapshot_trigger_ms: default_snapshot_trigger_ms(),
            initial_active_full_nodes: Vec::new(),
        }
    }
}

/// Persisted-schema settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSection {
    /// Snapshot-info files at or below this height use the V1 schema
    #[serde(default)]
    pub v1_snapshot_info: Height,
}

/// Cloud off-load settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSection {
    /// Enable cloud off-load and rollback backends
    #[serde(default)]
    pub enabled: bool,
    /// Ordered backend directories (head tried first)
    #[serde(default)]
    pub backends: Vec<PathBuf>,
}

/// Genesis settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenesisSection {
    /// Initial balance allocations, address hex -> amount
    #[serde(default)]
    pub alloc: HashMap<String, u64>,
}

impl NodeConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// The consensus manager configuration this file describes
    pub fn consensus_manager_config(&self) -> ConsensusManagerConfig {
        ConsensusManagerConfig {
            max_parallel_rounds: self.consensus.max_parallel_rounds,
            round_cooldown_ms: self.consensus.round_cooldown_ms,
            stage_timeout_ms: self.consensus.stage_timeout_ms,
            round_timeout_ms: self.consensus.round_timeout_ms,
            timeout_check_interval_ms: 500,
            round: RoundConfig {
                max_transaction_threshold: self.consensus.max_transaction_threshold,
                max_observation_threshold: self.consensus.max_observation_threshold,
            },
        }
    }

    /// The acceptance pipeline configuration this file describes
    pub fn acceptance_config(&self) -> AcceptanceConfig {
        AcceptanceConfig {
            resolution_timeout_ms: self.consensus.resolution_timeout_ms,
            ..Default::default()
        }
    }

    /// The snapshot service configuration this file describes
    pub fn snapshot_config(&self) -> anyhow::Result<SnapshotConfig> {
        let mut initial: BTreeSet<NodeId> = BTreeSet::new();
        for raw in &self.snapshot.initial_active_full_nodes {
            initial.insert(NodeId::from_hex(raw)?);
        }
        Ok(SnapshotConfig {
            snapshot_height_interval: self.snapshot.snapshot_height_interval,
            snapshot_height_delay_interval: self.snapshot.snapshot_height_delay_interval,
            active_peers_rotation_interval: self.snapshot.active_peers_rotation_interval,
            size_disk_limit: self.snapshot.size_disk_limit,
            initial_active_full_nodes: initial,
            ..Default::default()
        })
    }

    /// The rollback configuration this file describes
    pub fn rollback_config(&self) -> RollbackConfig {
        RollbackConfig {
            v1_max_height: self.schema.v1_snapshot_info,
        }
    }

    /// Parsed genesis allocations
    pub fn genesis_alloc(&self) -> anyhow::Result<Vec<(Address, u64)>> {
        let mut out = Vec::new();
        for (raw, amount) in &self.genesis.alloc {
            out.push((Address::from_hex(raw)?, *amount));
        }
        Ok(out)
    }
}
