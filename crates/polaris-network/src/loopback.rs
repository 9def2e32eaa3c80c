//! In-process transport connecting nodes over channels

use crate::client::{CheckpointProvider, PeerClient};
use crate::error::{NetworkError, NetworkResult};
use crate::messages::PeerMessage;
use async_trait::async_trait;
use dashmap::DashMap;
use polaris_primitives::{NodeId, H256};
use polaris_types::CheckpointCache;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

struct Registration {
    inbox: mpsc::UnboundedSender<(NodeId, PeerMessage)>,
    provider: Option<Arc<dyn CheckpointProvider>>,
}

/// An in-process network of nodes. Used by integration tests and the
/// single-process devnet; checkpoint fetches are answered directly from the
/// registered providers.
pub struct LoopbackNetwork {
    nodes: DashMap<NodeId, Registration>,
    weak: Weak<LoopbackNetwork>,
}

impl LoopbackNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            nodes: DashMap::new(),
            weak: weak.clone(),
        })
    }

    /// Register a node, returning its handle and message receiver
    pub fn register(
        &self,
        node_id: NodeId,
        provider: Option<Arc<dyn CheckpointProvider>>,
    ) -> (LoopbackHandle, mpsc::UnboundedReceiver<(NodeId, PeerMessage)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.insert(
            node_id,
            Registration {
                inbox: tx,
                provider,
            },
        );
        (
            LoopbackHandle {
                // The network is always owned by an Arc created in new().
                network: self.weak.upgrade().expect("network dropped"),
                node_id,
            },
            rx,
        )
    }

    /// Remove a node from the network
    pub fn unregister(&self, node_id: &NodeId) {
        self.nodes.remove(node_id);
    }

    fn deliver(&self, from: NodeId, to: NodeId, message: PeerMessage) -> NetworkResult<()> {
        let target = self
            .nodes
            .get(&to)
            .ok_or(NetworkError::PeerUnavailable(to))?;
        target
            .inbox
            .send((from, message))
            .map_err(|e| NetworkError::SendFailed(e.to_string()))
    }

    fn checkpoint_from(&self, peer: &NodeId, soe_hash: &H256) -> Option<CheckpointCache> {
        self.nodes
            .get(peer)
            .and_then(|r| r.provider.as_ref().and_then(|p| p.checkpoint(soe_hash)))
    }
}

/// One node's view of the loopback network
#[derive(Clone)]
pub struct LoopbackHandle {
    network: Arc<LoopbackNetwork>,
    node_id: NodeId,
}

impl LoopbackHandle {
    /// The node this handle belongs to
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}

#[async_trait]
impl PeerClient for LoopbackHandle {
    async fn send(&self, to: NodeId, message: PeerMessage) -> NetworkResult<()> {
        self.network.deliver(self.node_id, to, message)
    }

    async fn broadcast(&self, to: &[NodeId], message: PeerMessage) -> NetworkResult<()> {
        for peer in to {
            if *peer == self.node_id {
                continue;
            }
            if let Err(err) = self.network.deliver(self.node_id, *peer, message.clone()) {
                tracing::warn!(peer = %peer, error = %err, "loopback delivery failed");
            }
        }
        Ok(())
    }

    async fn fetch_checkpoint(
        &self,
        from: &[NodeId],
        soe_hash: H256,
    ) -> NetworkResult<Option<CheckpointCache>> {
        for peer in from {
            if *peer == self.node_id {
                continue;
            }
            if let Some(cache) = self.network.checkpoint_from(peer, &soe_hash) {
                return Ok(Some(cache));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    fn node(n: u8) -> NodeId {
        NodeId::from_bytes([n; 32])
    }

    struct MapProvider {
        blocks: Mutex<HashMap<H256, CheckpointCache>>,
    }

    impl CheckpointProvider for MapProvider {
        fn checkpoint(&self, soe_hash: &H256) -> Option<CheckpointCache> {
            self.blocks.lock().get(soe_hash).cloned()
        }
    }

    fn request() -> PeerMessage {
        PeerMessage::CheckpointRequest {
            soe_hash: H256::from_bytes([1u8; 32]),
        }
    }

    #[tokio::test]
    async fn test_send_delivers() {
        let network = LoopbackNetwork::new();
        let (a, _a_rx) = network.register(node(1), None);
        let (_b, mut b_rx) = network.register(node(2), None);

        a.send(node(2), request()).await.unwrap();

        let (from, msg) = b_rx.recv().await.unwrap();
        assert_eq!(from, node(1));
        assert!(matches!(msg, PeerMessage::CheckpointRequest { .. }));
    }

    #[tokio::test]
    async fn test_broadcast_skips_self() {
        let network = LoopbackNetwork::new();
        let (a, mut a_rx) = network.register(node(1), None);
        let (_b, mut b_rx) = network.register(node(2), None);

        a.broadcast(&[node(1), node(2)], request()).await.unwrap();

        assert!(b_rx.recv().await.is_some());
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let network = LoopbackNetwork::new();
        let (a, _a_rx) = network.register(node(1), None);

        let result = a.send(node(9), request()).await;
        assert!(matches!(result, Err(NetworkError::PeerUnavailable(_))));
    }

    #[tokio::test]
    async fn test_fetch_checkpoint_from_provider() {
        let network = LoopbackNetwork::new();

        let soe = H256::from_bytes([7u8; 32]);
        let cache = CheckpointCache {
            block: None,
            height: Some(3),
            children: Default::default(),
        };
        let provider = Arc::new(MapProvider {
            blocks: Mutex::new(HashMap::from([(soe, cache.clone())])),
        });

        let (a, _a_rx) = network.register(node(1), None);
        let (_b, _b_rx) = network.register(node(2), Some(provider));

        let fetched = a.fetch_checkpoint(&[node(2)], soe).await.unwrap();
        assert_eq!(fetched, Some(cache));

        let missing = a
            .fetch_checkpoint(&[node(2)], H256::from_bytes([8u8; 32]))
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
