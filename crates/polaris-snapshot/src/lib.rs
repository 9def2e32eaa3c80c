//! # polaris-snapshot
//!
//! Periodic sealing of accepted checkpoint intervals into signed
//! snapshots, their on-disk form, and rollback-restore from an external
//! object store.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod rollback;
mod service;
mod store;

pub use error::{RollbackError, SnapshotError, SnapshotResult};
pub use rollback::{
    DirectoryBackend, RollbackConfig, RollbackService, RollbackTarget, SnapshotBackend,
};
pub use service::{ActiveBetweenHeights, SnapshotConfig, SnapshotService};
pub use store::SnapshotFileStore;
