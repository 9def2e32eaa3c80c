//! Node lifecycle state

use serde::{Deserialize, Serialize};

/// Where the node is in its lifecycle. Acceptance buffers incoming blocks
/// while the final download sync is still running.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// Fully synced and participating
    #[default]
    Ready,
    /// Download finished, waiting for the final sync pass
    DownloadCompleteAwaitingFinalSync,
    /// Not participating
    Offline,
}
