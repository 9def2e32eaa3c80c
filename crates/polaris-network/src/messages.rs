//! Peer message set

use polaris_primitives::{NodeId, RoundId, H256};
use polaris_types::{
    CheckpointBlock, CheckpointCache, ConsensusDataProposal, HashSignature, RoundData,
    SelectedUnionBlock, UnionBlockProposal,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Which consensus phase a proposal message belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProposalPhase {
    /// Phase 1: consensus data proposals
    Data,
    /// Phase 2: union block proposals
    UnionBlock,
    /// Phase 3: selected union blocks
    Selected,
}

/// Messages exchanged between peers during consensus.
///
/// Delivery is at-least-once; receivers suppress duplicates by
/// `(round_id, facilitator, phase)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Coordinator announces a new round to its facilitators
    StartConsensusRound(RoundData),
    /// Phase-1 contribution
    ConsensusDataProposal(ConsensusDataProposal),
    /// Phase-2 union block
    UnionBlockProposal(UnionBlockProposal),
    /// Phase-3 selection
    SelectedUnionBlock(SelectedUnionBlock),
    /// Facilitators spread the accepted block to non-facilitators
    FinishedCheckpoint {
        /// The accepted cache
        cache: CheckpointCache,
        /// The facilitators that produced it
        facilitators: BTreeSet<NodeId>,
    },
    /// Request for a signature over a block
    SignatureRequest {
        /// The block to sign
        block: CheckpointBlock,
        /// The facilitators of the producing round
        facilitators: BTreeSet<NodeId>,
    },
    /// Response to a signature request
    SignatureResponse {
        /// The signature, when granted
        signature: Option<HashSignature>,
        /// Set when the signer no longer considers itself part of the pool
        re_register: bool,
    },
    /// Request for a stored checkpoint during parent resolution
    CheckpointRequest {
        /// SOE hash of the wanted block
        soe_hash: H256,
    },
    /// Response to a checkpoint request
    CheckpointResponse {
        /// The cache, when the peer holds it
        cache: Option<CheckpointCache>,
    },
}

impl PeerMessage {
    /// The duplicate-suppression key of proposal messages; `None` for
    /// messages that are idempotent anyway.
    pub fn dedup_key(&self) -> Option<(RoundId, NodeId, ProposalPhase)> {
        match self {
            PeerMessage::ConsensusDataProposal(p) => {
                Some((p.round_id, p.facilitator, ProposalPhase::Data))
            }
            PeerMessage::UnionBlockProposal(p) => {
                Some((p.round_id, p.facilitator, ProposalPhase::UnionBlock))
            }
            PeerMessage::SelectedUnionBlock(p) => {
                Some((p.round_id, p.facilitator, ProposalPhase::Selected))
            }
            _ => None,
        }
    }

    /// The round this message belongs to, when any
    pub fn round_id(&self) -> Option<RoundId> {
        match self {
            PeerMessage::StartConsensusRound(data) => Some(data.round_id),
            PeerMessage::ConsensusDataProposal(p) => Some(p.round_id),
            PeerMessage::UnionBlockProposal(p) => Some(p.round_id),
            PeerMessage::SelectedUnionBlock(p) => Some(p.round_id),
            _ => None,
        }
    }
}
