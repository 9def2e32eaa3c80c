//! Local on-disk snapshot storage

use crate::error::SnapshotResult;
use polaris_primitives::{Height, H256};
use polaris_types::{SnapshotInfo, StoredSnapshot};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// The `(height, hash)` pair of the last known majority state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MajorityMarker {
    /// Height the majority state sealed at
    pub height: Height,
    /// Snapshot hash at that height
    pub hash: H256,
}

/// File layout:
/// - `snapshot/<hash>`: serialized [`StoredSnapshot`]
/// - `snapshot_info/<hash>`: serialized [`SnapshotInfo`]
/// - `last_majority.json`: the restore marker
pub struct SnapshotFileStore {
    base_dir: PathBuf,
}

impl SnapshotFileStore {
    /// Open (and create) the store under a base directory
    pub fn new(base_dir: impl AsRef<Path>) -> SnapshotResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(base_dir.join("snapshot"))?;
        fs::create_dir_all(base_dir.join("snapshot_info"))?;
        Ok(Self { base_dir })
    }

    fn file_name(hash: &H256) -> String {
        hex::encode(hash.as_bytes())
    }

    fn snapshot_path(&self, hash: &H256) -> PathBuf {
        self.base_dir.join("snapshot").join(Self::file_name(hash))
    }

    fn info_path(&self, hash: &H256) -> PathBuf {
        self.base_dir
            .join("snapshot_info")
            .join(Self::file_name(hash))
    }

    /// Write a stored snapshot keyed by its hash
    pub fn write_snapshot(&self, hash: &H256, stored: &StoredSnapshot) -> SnapshotResult<()> {
        let encoded = serde_json::to_vec(stored)?;
        fs::write(self.snapshot_path(hash), encoded)?;
        Ok(())
    }

    /// Write the resumable node state keyed by its snapshot hash
    pub fn write_snapshot_info(&self, hash: &H256, info: &SnapshotInfo) -> SnapshotResult<()> {
        let encoded = serde_json::to_vec(info)?;
        fs::write(self.info_path(hash), encoded)?;
        Ok(())
    }

    /// Read a stored snapshot by hash
    pub fn read_snapshot(&self, hash: &H256) -> SnapshotResult<StoredSnapshot> {
        let raw = fs::read(self.snapshot_path(hash))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Read the resumable node state by snapshot hash
    pub fn read_snapshot_info(&self, hash: &H256) -> SnapshotResult<SnapshotInfo> {
        let raw = fs::read(self.info_path(hash))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Persist the last majority `(height, hash)` marker
    pub fn write_majority_marker(&self, marker: MajorityMarker) -> SnapshotResult<()> {
        let encoded = serde_json::to_vec(&marker)?;
        fs::write(self.base_dir.join("last_majority.json"), encoded)?;
        Ok(())
    }

    /// The last majority marker, when one was written
    pub fn read_majority_marker(&self) -> SnapshotResult<Option<MajorityMarker>> {
        let path = self.base_dir.join("last_majority.json");
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Usable disk space under the store, in bytes
    pub fn usable_space(&self) -> SnapshotResult<u64> {
        Ok(fs2::available_space(&self.base_dir)?)
    }

    /// Total size of all stored snapshot files, in bytes
    pub fn total_size(&self) -> SnapshotResult<u64> {
        let mut total = 0;
        for dir in ["snapshot", "snapshot_info"] {
            for entry in fs::read_dir(self.base_dir.join(dir))? {
                total += entry?.metadata()?.len();
            }
        }
        Ok(total)
    }

    /// Delete the oldest snapshot pair by modification time. Returns
    /// whether anything was deleted.
    pub fn delete_oldest(&self) -> SnapshotResult<bool> {
        let mut oldest: Option<(std::time::SystemTime, String)> = None;
        for entry in fs::read_dir(self.base_dir.join("snapshot"))? {
            let entry = entry?;
            let modified = entry.metadata()?.modified()?;
            let name = entry.file_name().to_string_lossy().to_string();
            if oldest.as_ref().map(|(t, _)| modified < *t).unwrap_or(true) {
                oldest = Some((modified, name));
            }
        }

        let Some((_, name)) = oldest else {
            return Ok(false);
        };
        tracing::info!(snapshot = %name, "deleting oldest snapshot to free space");
        let _ = fs::remove_file(self.base_dir.join("snapshot").join(&name));
        let _ = fs::remove_file(self.base_dir.join("snapshot_info").join(&name));
        Ok(true)
    }

    /// Whether writing `bytes` more would break the disk limit (`0`
    /// disables the limit)
    pub fn would_exceed_limit(&self, limit: u64, bytes: u64) -> SnapshotResult<bool> {
        if limit == 0 {
            return Ok(false);
        }
        Ok(self.total_size()? + bytes > limit)
    }
}
