//! The transport seam the core speaks through

use crate::error::NetworkResult;
use crate::messages::PeerMessage;
use async_trait::async_trait;
use polaris_primitives::{NodeId, H256};
use polaris_types::CheckpointCache;

/// Read access to locally stored checkpoints, served to peers during
/// parent resolution.
pub trait CheckpointProvider: Send + Sync {
    /// The cache for an SOE hash, when held
    fn checkpoint(&self, soe_hash: &H256) -> Option<CheckpointCache>;
}

/// What the consensus core needs from the transport: targeted sends,
/// broadcasts, and checkpoint fetches from peers.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Send a message to one peer
    async fn send(&self, to: NodeId, message: PeerMessage) -> NetworkResult<()>;

    /// Send a message to each of the given peers
    async fn broadcast(&self, to: &[NodeId], message: PeerMessage) -> NetworkResult<()>;

    /// Fetch a checkpoint by SOE hash from any of the given peers,
    /// returning the first hit.
    async fn fetch_checkpoint(
        &self,
        from: &[NodeId],
        soe_hash: H256,
    ) -> NetworkResult<Option<CheckpointCache>>;
}
