//! Round data and the proposal variants exchanged between facilitators

use polaris_primitives::{NodeId, RoundId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::block::{ChannelMessage, CheckpointBlock, ParentRef};
use crate::observation::Observation;
use crate::transaction::Transaction;

/// Stages of one consensus round, in protocol order. Transitions are
/// monotonic: a round never moves to a lower stage.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ConsensusStage {
    /// Round allocated, nothing exchanged yet
    Starting,
    /// Phase 1: collecting consensus data proposals
    WaitingForProposals,
    /// Phase 2: collecting union block proposals
    WaitingForBlockProposals,
    /// Resolving the majority union block
    ResolvingMajorityCheckpointBlock,
    /// Phase 3: collecting selected union blocks
    WaitingForSelectedBlocks,
    /// Accepting the agreed majority block
    AcceptingMajorityCheckpointBlock,
}

impl fmt::Display for ConsensusStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsensusStage::Starting => "starting",
            ConsensusStage::WaitingForProposals => "waiting_for_proposals",
            ConsensusStage::WaitingForBlockProposals => "waiting_for_block_proposals",
            ConsensusStage::ResolvingMajorityCheckpointBlock => "resolving_majority_cb",
            ConsensusStage::WaitingForSelectedBlocks => "waiting_for_selected_blocks",
            ConsensusStage::AcceptingMajorityCheckpointBlock => "accepting_majority_cb",
        };
        f.write_str(name)
    }
}

/// Immutable inputs of one round, fixed at creation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundData {
    /// Unique round identifier
    pub round_id: RoundId,
    /// Facilitator peers participating in the round (excluding self)
    pub peers: BTreeSet<NodeId>,
    /// Light peers observing the round
    pub light_peers: BTreeSet<NodeId>,
    /// The node that initiated the round
    pub facilitator_id: NodeId,
    /// Transactions pulled by the initiator
    pub transactions: Vec<Transaction>,
    /// Observations pulled by the initiator
    pub observations: Vec<Observation>,
    /// The two tip parent references the block will attach to
    pub tips_soe: [ParentRef; 2],
    /// Channel messages pulled by the initiator
    pub messages: Vec<ChannelMessage>,
}

/// Phase 1: a facilitator's contribution of candidate data
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusDataProposal {
    /// Round this proposal belongs to
    pub round_id: RoundId,
    /// Proposing facilitator
    pub facilitator: NodeId,
    /// Candidate transactions
    pub transactions: Vec<Transaction>,
    /// Candidate observations
    pub observations: Vec<Observation>,
    /// Candidate channel messages
    pub messages: Vec<ChannelMessage>,
    /// Candidate notification hashes
    pub notifications: Vec<polaris_primitives::H256>,
}

/// Phase 2: a facilitator's union block over all phase-1 data
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnionBlockProposal {
    /// Round this proposal belongs to
    pub round_id: RoundId,
    /// Proposing facilitator
    pub facilitator: NodeId,
    /// The proposed union block
    pub block: CheckpointBlock,
}

/// Phase 3: a facilitator's pick of the majority union block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedUnionBlock {
    /// Round this proposal belongs to
    pub round_id: RoundId,
    /// Selecting facilitator
    pub facilitator: NodeId,
    /// The selected (signature-merged) block
    pub block: CheckpointBlock,
}
