//! Checkpoint blocks: the nodes of the accepted DAG

use polaris_crypto::{keccak256, recover_signer, sign_hash, CryptoError, Keypair, Signature};
use polaris_primitives::{Height, NodeId, H256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::observation::Observation;
use crate::transaction::Transaction;

/// Reference to one parent of a checkpoint block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    /// Signed-observation-edge hash of the parent (includes signer set)
    pub soe_hash: H256,
    /// Content hash of the parent (excludes signatures)
    pub base_hash: H256,
}

/// A facilitator's signature over a block's base hash
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashSignature {
    /// Claimed signer identity
    pub signer: NodeId,
    /// Signature over the base hash
    pub signature: Signature,
}

impl HashSignature {
    /// Verify this signature against a base hash: it must recover to the
    /// claimed signer.
    pub fn verify(&self, base_hash: &H256) -> bool {
        matches!(recover_signer(base_hash, &self.signature), Ok(id) if id == self.signer)
    }
}

/// Opaque payload routed through a state channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Channel identifier
    pub channel_id: H256,
    /// Raw message payload
    #[serde(with = "crate::hex_bytes")]
    pub payload: Vec<u8>,
}

/// A DAG node: transactions plus observations, anchored to two parents and
/// carrying the signatures of the facilitators that produced it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointBlock {
    /// Ordered transactions
    pub transactions: Vec<Transaction>,
    /// Parent references (exactly two after genesis)
    pub parents: Vec<ParentRef>,
    /// Ordered observations
    pub observations: Vec<Observation>,
    /// Channel messages carried by this block
    pub messages: Vec<ChannelMessage>,
    /// Notification hashes carried by this block
    pub notifications: Vec<H256>,
    /// Facilitator signatures, kept sorted by signer id
    pub signatures: Vec<HashSignature>,
}

impl CheckpointBlock {
    /// Build an unsigned block over the given content
    pub fn new(
        transactions: Vec<Transaction>,
        parents: Vec<ParentRef>,
        observations: Vec<Observation>,
        messages: Vec<ChannelMessage>,
        notifications: Vec<H256>,
    ) -> Self {
        Self {
            transactions,
            parents,
            observations,
            messages,
            notifications,
            signatures: Vec::new(),
        }
    }

    /// Content hash excluding signatures. Blocks assembled by different
    /// facilitator subsets compare equal under this hash.
    pub fn base_hash(&self) -> H256 {
        let mut buf = Vec::with_capacity(1024);
        for tx in &self.transactions {
            buf.extend_from_slice(tx.hash().as_bytes());
        }
        for parent in &self.parents {
            buf.extend_from_slice(parent.soe_hash.as_bytes());
            buf.extend_from_slice(parent.base_hash.as_bytes());
        }
        for obs in &self.observations {
            buf.extend_from_slice(obs.hash().as_bytes());
        }
        for msg in &self.messages {
            buf.extend_from_slice(msg.channel_id.as_bytes());
            buf.extend_from_slice(&msg.payload);
        }
        for notification in &self.notifications {
            buf.extend_from_slice(notification.as_bytes());
        }
        keccak256(&buf)
    }

    /// Signed-observation-edge hash: the base hash combined with the sorted
    /// signer set, so the same content under different signer unions gets a
    /// distinct identity.
    pub fn soe_hash(&self) -> H256 {
        let mut buf = Vec::with_capacity(32 + 32 * self.signatures.len());
        buf.extend_from_slice(self.base_hash().as_bytes());
        let mut signers: Vec<NodeId> = self.signatures.iter().map(|s| s.signer).collect();
        signers.sort();
        for signer in signers {
            buf.extend_from_slice(signer.as_bytes());
        }
        keccak256(&buf)
    }

    /// Append this node's signature over the base hash
    pub fn sign(&mut self, keypair: &Keypair) -> Result<(), CryptoError> {
        let signature = sign_hash(&self.base_hash(), keypair.private())?;
        self.insert_signature(HashSignature {
            signer: keypair.node_id(),
            signature,
        });
        Ok(())
    }

    /// Merge another block's signature set into this one.
    ///
    /// Content must match (`base_hash` equality is the caller's contract);
    /// the result carries the union of both signer sets.
    pub fn plus_edge(mut self, other: &CheckpointBlock) -> CheckpointBlock {
        for sig in &other.signatures {
            self.insert_signature(*sig);
        }
        self
    }

    fn insert_signature(&mut self, sig: HashSignature) {
        if self.signatures.iter().any(|s| s.signer == sig.signer) {
            return;
        }
        self.signatures.push(sig);
        self.signatures.sort_by_key(|s| s.signer);
    }

    /// The sorted signer set of this block
    pub fn signers(&self) -> Vec<NodeId> {
        self.signatures.iter().map(|s| s.signer).collect()
    }

    /// Verify every signature against its claimed signer
    pub fn verify_signatures(&self) -> bool {
        let base = self.base_hash();
        self.signatures.iter().all(|s| s.verify(&base))
    }

    /// Hashes of the contained transactions, in block order
    pub fn transaction_hashes(&self) -> Vec<H256> {
        self.transactions.iter().map(|tx| tx.hash()).collect()
    }
}

/// A checkpoint block as held by storage: the block, its resolved height,
/// and the hashes of accepted children. Once persisted the block itself is
/// immutable; `children` only grows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointCache {
    /// The block, absent only for malformed peer payloads
    pub block: Option<CheckpointBlock>,
    /// DAG height, known once both parents are resolved
    pub height: Option<Height>,
    /// Base hashes of accepted children
    pub children: BTreeSet<H256>,
}

impl CheckpointCache {
    /// Wrap a block with no height resolved yet
    pub fn new(block: CheckpointBlock) -> Self {
        Self {
            block: Some(block),
            height: None,
            children: BTreeSet::new(),
        }
    }

    /// Wrap a block at a known height
    pub fn with_height(block: CheckpointBlock, height: Height) -> Self {
        Self {
            block: Some(block),
            height: Some(height),
            children: BTreeSet::new(),
        }
    }

    /// Base hash of the contained block
    pub fn base_hash(&self) -> Option<H256> {
        self.block.as_ref().map(|b| b.base_hash())
    }

    /// SOE hash of the contained block
    pub fn soe_hash(&self) -> Option<H256> {
        self.block.as_ref().map(|b| b.soe_hash())
    }
}
