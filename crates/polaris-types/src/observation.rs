//! Signed peer-behavior observations

use polaris_crypto::{keccak256, sign_hash, CryptoError, Keypair, Signature};
use polaris_primitives::{NodeId, H256};
use serde::{Deserialize, Serialize};

/// Observed peer behavior kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObservationEvent {
    /// Node was a member of the active pool at snapshot time
    NodeMemberOfActivePool,
    /// Node was absent from the active pool at snapshot time
    NodeNotMemberOfActivePool,
    /// Node proposed a checkpoint block whose parents could not be resolved
    CheckpointBlockWithMissingParents,
    /// Node proposed a checkpoint block that failed validation
    CheckpointBlockInvalid,
}

impl ObservationEvent {
    fn tag(&self) -> u8 {
        match self {
            ObservationEvent::NodeMemberOfActivePool => 0,
            ObservationEvent::NodeNotMemberOfActivePool => 1,
            ObservationEvent::CheckpointBlockWithMissingParents => 2,
            ObservationEvent::CheckpointBlockInvalid => 3,
        }
    }
}

/// A signed record of one node's behavior as seen by another
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// The node reporting the behavior
    pub observer: NodeId,
    /// The node the behavior is about
    pub subject: NodeId,
    /// What was observed
    pub event: ObservationEvent,
    /// Unix time of the observation, in seconds
    pub epoch_seconds: u64,
    /// Observer signature over the content hash
    pub signature: Signature,
}

impl Observation {
    /// Build and sign an observation.
    pub fn new(
        keypair: &Keypair,
        subject: NodeId,
        event: ObservationEvent,
        epoch_seconds: u64,
    ) -> Result<Self, CryptoError> {
        let mut obs = Self {
            observer: keypair.node_id(),
            subject,
            event,
            epoch_seconds,
            signature: Signature::ZERO,
        };
        obs.signature = sign_hash(&obs.hash(), keypair.private())?;
        Ok(obs)
    }

    /// Deterministic content hash, excluding the signature
    pub fn hash(&self) -> H256 {
        let mut buf = Vec::with_capacity(80);
        buf.extend_from_slice(self.observer.as_bytes());
        buf.extend_from_slice(self.subject.as_bytes());
        buf.push(self.event.tag());
        buf.extend_from_slice(&self.epoch_seconds.to_le_bytes());
        keccak256(&buf)
    }
}
