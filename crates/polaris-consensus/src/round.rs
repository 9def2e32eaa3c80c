//! One consensus round: the three-phase state machine

use crate::error::{RoundError, RoundResult};
use polaris_core::{AcceptanceError, AcceptanceService};
use polaris_crypto::Keypair;
use polaris_mempool::{PendingObservations, PendingTransactions};
use polaris_metrics::Metrics;
use polaris_network::{PeerClient, PeerMessage};
use polaris_primitives::{NodeId, RoundId, H256};
use polaris_types::{
    ChannelMessage, CheckpointBlock, CheckpointCache, ConsensusDataProposal, ConsensusStage,
    Observation, RoundData, SelectedUnionBlock, Transaction, TransactionStatus,
    UnionBlockProposal,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-round limits
#[derive(Debug, Clone)]
pub struct RoundConfig {
    /// Phase-1 transaction cap
    pub max_transaction_threshold: usize,
    /// Phase-1 observation cap
    pub max_observation_threshold: usize,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            max_transaction_threshold: 50,
            max_observation_threshold: 50,
        }
    }
}

/// How a finished round ended: the accepted block, if any, and the data
/// that must flow back to the mempools.
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    /// The accepted checkpoint, when the round committed one
    pub accepted: Option<CheckpointCache>,
    /// Transactions to return to the pending pool
    pub transactions_to_return: Vec<Transaction>,
    /// Observations to return to the pending pool
    pub observations_to_return: Vec<Observation>,
}

impl RoundOutcome {
    fn accepted(cache: CheckpointCache) -> Self {
        Self {
            accepted: Some(cache),
            transactions_to_return: Vec::new(),
            observations_to_return: Vec::new(),
        }
    }

    fn in_pipeline() -> Self {
        Self {
            accepted: None,
            transactions_to_return: Vec::new(),
            observations_to_return: Vec::new(),
        }
    }
}

struct RoundInner {
    stage: ConsensusStage,
    stage_changed_at: Instant,
    data_proposals: HashMap<NodeId, ConsensusDataProposal>,
    /// First-appearance order of data proposals, for the stable union
    data_order: Vec<NodeId>,
    block_proposals: HashMap<NodeId, CheckpointBlock>,
    selected_blocks: HashMap<NodeId, CheckpointBlock>,
}

impl RoundInner {
    fn advance(&mut self, stage: ConsensusStage) {
        debug_assert!(self.stage <= stage);
        self.stage = stage;
        self.stage_changed_at = Instant::now();
    }
}

/// What a state change requires after the round mutex is released
enum Followup {
    Union,
    ResolveMajority,
    AcceptMajority,
}

/// One active consensus round.
///
/// All mutable state sits behind a single async mutex (the round's update
/// semaphore); message handlers mutate under it and run their follow-up
/// work after releasing it.
pub struct Round {
    node_id: NodeId,
    keypair: Arc<Keypair>,
    round_data: RoundData,
    config: RoundConfig,
    peers: Arc<dyn PeerClient>,
    acceptance: Arc<AcceptanceService>,
    transactions_pool: Arc<PendingTransactions>,
    observations_pool: Arc<PendingObservations>,
    metrics: Arc<Metrics>,
    inner: tokio::sync::Mutex<RoundInner>,
}

impl Round {
    /// Create a round from its immutable round data
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        keypair: Arc<Keypair>,
        round_data: RoundData,
        config: RoundConfig,
        peers: Arc<dyn PeerClient>,
        acceptance: Arc<AcceptanceService>,
        transactions_pool: Arc<PendingTransactions>,
        observations_pool: Arc<PendingObservations>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            node_id,
            keypair,
            round_data,
            config,
            peers,
            acceptance,
            transactions_pool,
            observations_pool,
            metrics,
            inner: tokio::sync::Mutex::new(RoundInner {
                stage: ConsensusStage::Starting,
                stage_changed_at: Instant::now(),
                data_proposals: HashMap::new(),
                data_order: Vec::new(),
                block_proposals: HashMap::new(),
                selected_blocks: HashMap::new(),
            }),
        }
    }

    /// The round identifier
    pub fn round_id(&self) -> RoundId {
        self.round_data.round_id
    }

    /// Facilitator count: peers plus self
    fn facilitator_total(&self) -> usize {
        self.round_data.peers.len() + 1
    }

    /// Peer list for broadcasts
    fn peer_vec(&self) -> Vec<NodeId> {
        self.round_data.peers.iter().copied().collect()
    }

    /// Current stage and how long the round has sat in it
    pub async fn stage_info(&self) -> (ConsensusStage, Duration) {
        let inner = self.inner.lock().await;
        (inner.stage, inner.stage_changed_at.elapsed())
    }

    /// Proposal count and facilitator total for the phase the round is
    /// currently waiting in
    pub async fn phase_progress(&self) -> (usize, usize) {
        let inner = self.inner.lock().await;
        let count = match inner.stage {
            ConsensusStage::Starting | ConsensusStage::WaitingForProposals => {
                inner.data_proposals.len()
            }
            ConsensusStage::WaitingForBlockProposals
            | ConsensusStage::ResolvingMajorityCheckpointBlock => inner.block_proposals.len(),
            ConsensusStage::WaitingForSelectedBlocks
            | ConsensusStage::AcceptingMajorityCheckpointBlock => inner.selected_blocks.len(),
        };
        (count, self.facilitator_total())
    }

    /// Start the round: pull this node's candidate data, broadcast the
    /// phase-1 proposal, and record it locally.
    pub async fn start(&self) -> RoundResult<Option<RoundOutcome>> {
        let transactions = self
            .transactions_pool
            .pull_for_consensus(self.config.max_transaction_threshold);
        let observations = self
            .observations_pool
            .pull_for_consensus(self.config.max_observation_threshold);

        {
            let mut inner = self.inner.lock().await;
            if inner.stage == ConsensusStage::Starting {
                inner.advance(ConsensusStage::WaitingForProposals);
            }
        }

        let proposal = ConsensusDataProposal {
            round_id: self.round_data.round_id,
            facilitator: self.node_id,
            transactions,
            observations,
            messages: Vec::new(),
            notifications: Vec::new(),
        };

        self.peers
            .broadcast(
                &self.peer_vec(),
                PeerMessage::ConsensusDataProposal(proposal.clone()),
            )
            .await
            .ok();

        self.add_data_proposal(proposal).await
    }

    /// Record a phase-1 proposal; runs the union once all peers reported.
    pub async fn add_data_proposal(
        &self,
        proposal: ConsensusDataProposal,
    ) -> RoundResult<Option<RoundOutcome>> {
        // Data arriving from a peer becomes reachable through our pools.
        if proposal.facilitator != self.node_id {
            for tx in &proposal.transactions {
                if !self.transactions_pool.contains(&tx.hash()) {
                    self.transactions_pool
                        .put(tx.clone(), TransactionStatus::Unknown);
                }
            }
            for obs in &proposal.observations {
                if !self.observations_pool.contains(&obs.hash()) {
                    self.observations_pool.put(obs.clone());
                }
            }
        }

        let followup = {
            let mut inner = self.inner.lock().await;
            if inner.stage >= ConsensusStage::WaitingForBlockProposals {
                return Err(RoundError::PreviousStage { stage: inner.stage });
            }

            match inner.data_proposals.get_mut(&proposal.facilitator) {
                Some(existing) => merge_data_proposals(existing, proposal),
                None => {
                    inner.data_order.push(proposal.facilitator);
                    inner.data_proposals.insert(proposal.facilitator, proposal);
                }
            }

            let peer_proposals = inner
                .data_proposals
                .keys()
                .filter(|id| **id != self.node_id)
                .count();
            if peer_proposals == self.round_data.peers.len() {
                inner.advance(ConsensusStage::WaitingForBlockProposals);
                Some(Followup::Union)
            } else {
                None
            }
        };

        self.drive(followup).await
    }

    /// Record a phase-2 union block; resolves the majority once all
    /// facilitators reported.
    pub async fn add_block_proposal(
        &self,
        proposal: UnionBlockProposal,
    ) -> RoundResult<Option<RoundOutcome>> {
        let followup = {
            let mut inner = self.inner.lock().await;
            if inner.stage >= ConsensusStage::ResolvingMajorityCheckpointBlock {
                return Err(RoundError::PreviousStage { stage: inner.stage });
            }

            inner
                .block_proposals
                .insert(proposal.facilitator, proposal.block);

            if inner.block_proposals.len() == self.facilitator_total() {
                inner.advance(ConsensusStage::ResolvingMajorityCheckpointBlock);
                Some(Followup::ResolveMajority)
            } else {
                None
            }
        };

        self.drive(followup).await
    }

    /// Record a phase-3 selection; accepts the majority once all
    /// facilitators reported.
    pub async fn add_selected_block(
        &self,
        proposal: SelectedUnionBlock,
    ) -> RoundResult<Option<RoundOutcome>> {
        let followup = {
            let mut inner = self.inner.lock().await;
            if inner.stage >= ConsensusStage::AcceptingMajorityCheckpointBlock {
                return Err(RoundError::PreviousStage { stage: inner.stage });
            }

            inner
                .selected_blocks
                .insert(proposal.facilitator, proposal.block);

            if inner.selected_blocks.len() == self.facilitator_total() {
                inner.advance(ConsensusStage::AcceptingMajorityCheckpointBlock);
                Some(Followup::AcceptMajority)
            } else {
                None
            }
        };

        self.drive(followup).await
    }

    /// Stage timeout in phase 1: force a union over whatever proposals are
    /// present, provided the 51% threshold is met.
    pub async fn force_union(&self) -> RoundResult<Option<RoundOutcome>> {
        let followup = {
            let mut inner = self.inner.lock().await;
            if inner.stage >= ConsensusStage::WaitingForBlockProposals {
                // Already progressed past phase 1; nothing to force.
                return Ok(None);
            }

            let count = inner.data_proposals.len();
            let total = self.facilitator_total();
            if count == 0 {
                return Err(RoundError::EmptyProposals);
            }
            if count * 100 < 51 * total {
                return Err(RoundError::NotEnoughProposals { count, total });
            }

            tracing::warn!(
                round_id = %self.round_data.round_id,
                count,
                total,
                "forcing union on partial proposals"
            );
            inner.advance(ConsensusStage::WaitingForBlockProposals);
            Some(Followup::Union)
        };

        self.drive(followup).await
    }

    /// Everything this round holds that would need returning to the pools
    /// if it dies: the round data plus all proposal contents.
    pub async fn data_to_return(&self) -> (Vec<Transaction>, Vec<Observation>) {
        let inner = self.inner.lock().await;
        self.collect_data(&inner)
    }

    fn collect_data(&self, inner: &RoundInner) -> (Vec<Transaction>, Vec<Observation>) {
        let mut txs: Vec<Transaction> = Vec::new();
        let mut tx_seen: HashSet<H256> = HashSet::new();
        let mut obs: Vec<Observation> = Vec::new();
        let mut obs_seen: HashSet<H256> = HashSet::new();

        let mut push_tx = |tx: &Transaction| {
            if tx_seen.insert(tx.hash()) {
                txs.push(tx.clone());
            }
        };
        for tx in &self.round_data.transactions {
            push_tx(tx);
        }
        for id in &inner.data_order {
            if let Some(p) = inner.data_proposals.get(id) {
                for tx in &p.transactions {
                    push_tx(tx);
                }
            }
        }

        let mut push_obs = |o: &Observation| {
            if obs_seen.insert(o.hash()) {
                obs.push(o.clone());
            }
        };
        for o in &self.round_data.observations {
            push_obs(o);
        }
        for id in &inner.data_order {
            if let Some(p) = inner.data_proposals.get(id) {
                for o in &p.observations {
                    push_obs(o);
                }
            }
        }

        (txs, obs)
    }

    async fn drive(&self, mut followup: Option<Followup>) -> RoundResult<Option<RoundOutcome>> {
        while let Some(f) = followup {
            let (next, outcome) = match f {
                Followup::Union => (self.run_union().await?, None),
                Followup::ResolveMajority => (self.run_resolve_majority().await?, None),
                Followup::AcceptMajority => (None, Some(self.run_accept_majority().await?)),
            };
            if outcome.is_some() {
                return Ok(outcome);
            }
            followup = next;
        }
        Ok(None)
    }

    /// Union step: merge round data and every phase-1 proposal into one
    /// block over the round's tips, sign it, broadcast it, record it.
    async fn run_union(&self) -> RoundResult<Option<Followup>> {
        let block = {
            let inner = self.inner.lock().await;
            let (transactions, observations) = self.collect_data(&inner);

            let mut messages: Vec<ChannelMessage> = self.round_data.messages.clone();
            let mut notifications: Vec<H256> = Vec::new();
            for id in &inner.data_order {
                if let Some(p) = inner.data_proposals.get(id) {
                    for msg in &p.messages {
                        if !messages.contains(msg) {
                            messages.push(msg.clone());
                        }
                    }
                    for n in &p.notifications {
                        if !notifications.contains(n) {
                            notifications.push(*n);
                        }
                    }
                }
            }

            let mut block = CheckpointBlock::new(
                transactions,
                self.round_data.tips_soe.to_vec(),
                observations,
                messages,
                notifications,
            );
            block
                .sign(&self.keypair)
                .map_err(|e| RoundError::Internal(e.to_string()))?;
            block
        };

        let proposal = UnionBlockProposal {
            round_id: self.round_data.round_id,
            facilitator: self.node_id,
            block,
        };
        self.peers
            .broadcast(
                &self.peer_vec(),
                PeerMessage::UnionBlockProposal(proposal.clone()),
            )
            .await
            .ok();

        // Record our own proposal without re-entering drive().
        let mut inner = self.inner.lock().await;
        if inner.stage >= ConsensusStage::ResolvingMajorityCheckpointBlock {
            return Ok(None);
        }
        inner
            .block_proposals
            .insert(proposal.facilitator, proposal.block);
        if inner.block_proposals.len() == self.facilitator_total() {
            inner.advance(ConsensusStage::ResolvingMajorityCheckpointBlock);
            Ok(Some(Followup::ResolveMajority))
        } else {
            Ok(None)
        }
    }

    /// Resolve step: find the largest base-hash group among the union
    /// proposals, merge its signer sets, and put the result up for
    /// selection.
    async fn run_resolve_majority(&self) -> RoundResult<Option<Followup>> {
        let merged = {
            let mut inner = self.inner.lock().await;

            let count = inner.block_proposals.len();
            let total = self.facilitator_total();
            if count * 100 < 51 * total {
                return Err(RoundError::NotEnoughProposals { count, total });
            }

            let winning = majority_group(inner.block_proposals.values(), |b| b.base_hash());
            let merged = winning
                .into_iter()
                .cloned()
                .reduce(|acc, block| acc.plus_edge(&block))
                .ok_or(RoundError::EmptyProposals)?;

            inner.advance(ConsensusStage::WaitingForSelectedBlocks);
            merged
        };

        let proposal = SelectedUnionBlock {
            round_id: self.round_data.round_id,
            facilitator: self.node_id,
            block: merged,
        };
        self.peers
            .broadcast(
                &self.peer_vec(),
                PeerMessage::SelectedUnionBlock(proposal.clone()),
            )
            .await
            .ok();

        let mut inner = self.inner.lock().await;
        if inner.stage >= ConsensusStage::AcceptingMajorityCheckpointBlock {
            return Ok(None);
        }
        inner
            .selected_blocks
            .insert(proposal.facilitator, proposal.block);
        if inner.selected_blocks.len() == self.facilitator_total() {
            inner.advance(ConsensusStage::AcceptingMajorityCheckpointBlock);
            Ok(Some(Followup::AcceptMajority))
        } else {
            Ok(None)
        }
    }

    /// Accept step: require full agreement, admit the majority block, and
    /// turn the acceptance verdict into the round's outcome.
    async fn run_accept_majority(&self) -> RoundResult<RoundOutcome> {
        let (block, all_txs, all_obs) = {
            let inner = self.inner.lock().await;

            let count = inner.selected_blocks.len();
            let total = self.facilitator_total();
            if count < total {
                return Err(RoundError::NotEnoughProposals { count, total });
            }

            let winning = majority_group(inner.selected_blocks.values(), |b| b.soe_hash());
            let block = (*winning[0]).clone();
            let (txs, obs) = self.collect_data(&inner);
            (block, txs, obs)
        };

        let cache = CheckpointCache::new(block);
        let outcome = match self.acceptance.accept(cache, &self.peer_vec()).await {
            Ok(Some(admitted)) => {
                self.spread_finished(&admitted).await;
                RoundOutcome::accepted(admitted)
            }
            Ok(None) => RoundOutcome::in_pipeline(),
            Err(err) if err.is_informational() || err.is_transient() => {
                tracing::debug!(
                    round_id = %self.round_data.round_id,
                    error = %err,
                    "majority block already in pipeline"
                );
                RoundOutcome::in_pipeline()
            }
            Err(AcceptanceError::TipConflict { conflicting }) => {
                self.metrics.counter("consensus.majority_conflicts", 1);
                RoundOutcome {
                    accepted: None,
                    transactions_to_return: without(all_txs, &conflicting),
                    observations_to_return: all_obs,
                }
            }
            Err(AcceptanceError::ContainsInvalidTransactions { invalid }) => {
                RoundOutcome {
                    accepted: None,
                    transactions_to_return: without(all_txs, &invalid),
                    observations_to_return: all_obs,
                }
            }
            Err(err) => {
                tracing::warn!(
                    round_id = %self.round_data.round_id,
                    error = %err,
                    "majority block failed acceptance"
                );
                RoundOutcome {
                    accepted: None,
                    transactions_to_return: all_txs,
                    observations_to_return: all_obs,
                }
            }
        };

        Ok(outcome)
    }

    /// Spread the finished checkpoint to non-facilitators.
    async fn spread_finished(&self, cache: &CheckpointCache) {
        if self.round_data.light_peers.is_empty() {
            return;
        }
        let facilitators: BTreeSet<NodeId> = self
            .round_data
            .peers
            .iter()
            .copied()
            .chain(std::iter::once(self.node_id))
            .collect();
        let targets: Vec<NodeId> = self.round_data.light_peers.iter().copied().collect();
        self.peers
            .broadcast(
                &targets,
                PeerMessage::FinishedCheckpoint {
                    cache: cache.clone(),
                    facilitators,
                },
            )
            .await
            .ok();
    }
}

/// Merge a redelivered or extended proposal into the recorded one,
/// unioning all four payload sequences by identity.
fn merge_data_proposals(existing: &mut ConsensusDataProposal, incoming: ConsensusDataProposal) {
    let seen: HashSet<H256> = existing.transactions.iter().map(|t| t.hash()).collect();
    for tx in incoming.transactions {
        if !seen.contains(&tx.hash()) {
            existing.transactions.push(tx);
        }
    }
    let seen: HashSet<H256> = existing.observations.iter().map(|o| o.hash()).collect();
    for obs in incoming.observations {
        if !seen.contains(&obs.hash()) {
            existing.observations.push(obs);
        }
    }
    for msg in incoming.messages {
        if !existing.messages.contains(&msg) {
            existing.messages.push(msg);
        }
    }
    for n in incoming.notifications {
        if !existing.notifications.contains(&n) {
            existing.notifications.push(n);
        }
    }
}

/// The largest group under `key`, breaking size ties by the smaller key.
fn majority_group<'a, B, I, K>(blocks: I, key: K) -> Vec<&'a B>
where
    I: Iterator<Item = &'a B>,
    K: Fn(&B) -> H256,
{
    let mut groups: HashMap<H256, Vec<&B>> = HashMap::new();
    for block in blocks {
        groups.entry(key(block)).or_default().push(block);
    }
    let mut entries: Vec<(H256, Vec<&B>)> = groups.into_iter().collect();
    entries.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(&b.0)));
    entries.into_iter().next().map(|(_, g)| g).unwrap_or_default()
}

fn without(txs: Vec<Transaction>, excluded: &[H256]) -> Vec<Transaction> {
    let excluded: HashSet<&H256> = excluded.iter().collect();
    txs.into_iter()
        .filter(|tx| !excluded.contains(&tx.hash()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use polaris_core::AcceptanceConfig;
    use polaris_mempool::TransactionChainService;
    use polaris_network::LoopbackNetwork;
    use polaris_primitives::Address;
    use polaris_storage::{
        AcceptedLog, AddressStore, CheckpointStorage, TipService, TipServiceConfig,
    };
    use polaris_types::{LastTransactionRef, ParentRef};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn node(n: u8) -> NodeId {
        NodeId::from_bytes([n; 32])
    }

    fn addr(n: u8) -> Address {
        Address::from_bytes([n; 20])
    }

    /// Build `count` chained signed transactions from a fresh sender
    fn chain_of(keypair: &Keypair, count: u64) -> Vec<Transaction> {
        let mut out = Vec::new();
        let mut reference = LastTransactionRef::genesis(&keypair.address());
        for ordinal in 1..=count {
            let tx =
                Transaction::new(keypair, addr(0xEE), 1, Some(1), ordinal, reference).unwrap();
            reference = LastTransactionRef {
                hash: tx.hash(),
                ordinal,
            };
            out.push(tx);
        }
        out
    }

    struct Fixture {
        round: Arc<Round>,
        acceptance: Arc<AcceptanceService>,
        accepted_log: Arc<AcceptedLog>,
        transactions_pool: Arc<PendingTransactions>,
        peer2_rx: UnboundedReceiver<(NodeId, PeerMessage)>,
    }

    fn fixture(round_txs: Vec<Transaction>) -> Fixture {
        let storage = Arc::new(CheckpointStorage::new());
        let tips = Arc::new(TipService::new(
            TipServiceConfig::default(),
            Arc::clone(&storage),
        ));
        let chain = Arc::new(TransactionChainService::new());
        let addresses = Arc::new(AddressStore::new());
        let accepted_log = Arc::new(AcceptedLog::new());
        let network = LoopbackNetwork::new();

        let (handle, _rx1) = network.register(node(1), None);
        let (_h2, peer2_rx) = network.register(node(2), None);
        let (_h3, _rx3) = network.register(node(3), None);

        let acceptance = Arc::new(AcceptanceService::new(
            AcceptanceConfig::default(),
            Arc::clone(&storage),
            Arc::clone(&tips),
            Arc::clone(&chain),
            Arc::clone(&addresses),
            Arc::clone(&accepted_log),
            Arc::new(handle.clone()),
            Arc::new(Metrics::new()),
        ));

        // Two seeded roots serve as the round's tips.
        let mut parents = Vec::new();
        for marker in [0xA0u8, 0xB0] {
            let root = CheckpointBlock::new(
                vec![],
                vec![],
                vec![],
                vec![],
                vec![H256::from_bytes([marker; 32])],
            );
            parents.push(ParentRef {
                soe_hash: root.soe_hash(),
                base_hash: root.base_hash(),
            });
            acceptance.seed(CheckpointCache::with_height(root, 0));
        }

        let round_data = RoundData {
            round_id: RoundId::from_bytes([0x11; 16]),
            peers: [node(2), node(3)].into_iter().collect(),
            light_peers: Default::default(),
            facilitator_id: node(1),
            transactions: round_txs,
            observations: vec![],
            tips_soe: [parents[0], parents[1]],
            messages: vec![],
        };

        let transactions_pool = Arc::new(PendingTransactions::new(Arc::clone(&chain)));
        let round = Arc::new(Round::new(
            node(1),
            Arc::new(Keypair::generate()),
            round_data,
            RoundConfig::default(),
            Arc::new(handle),
            Arc::clone(&acceptance),
            Arc::clone(&transactions_pool),
            Arc::new(PendingObservations::new()),
            Arc::new(Metrics::new()),
        ));

        Fixture {
            round,
            acceptance,
            accepted_log,
            transactions_pool,
            peer2_rx,
        }
    }

    fn empty_proposal(round_id: RoundId, facilitator: NodeId) -> ConsensusDataProposal {
        ConsensusDataProposal {
            round_id,
            facilitator,
            transactions: vec![],
            observations: vec![],
            messages: vec![],
            notifications: vec![],
        }
    }

    /// Pull the next message of a given shape off a peer inbox
    fn next_union_block(rx: &mut UnboundedReceiver<(NodeId, PeerMessage)>) -> CheckpointBlock {
        while let Ok((_, msg)) = rx.try_recv() {
            if let PeerMessage::UnionBlockProposal(p) = msg {
                return p.block;
            }
        }
        panic!("no union block broadcast seen");
    }

    fn next_selected_block(rx: &mut UnboundedReceiver<(NodeId, PeerMessage)>) -> CheckpointBlock {
        while let Ok((_, msg)) = rx.try_recv() {
            if let PeerMessage::SelectedUnionBlock(p) = msg {
                return p.block;
            }
        }
        panic!("no selected block broadcast seen");
    }

    #[tokio::test]
    async fn test_full_round_happy_path() {
        // Three facilitators agree on identical content; one block with all
        // five transactions lands in the DAG.
        let txs = chain_of(&Keypair::generate(), 5);
        let mut fx = fixture(txs);
        let round_id = fx.round.round_id();
        let kp2 = Keypair::generate();
        let kp3 = Keypair::generate();

        assert!(fx.round.start().await.unwrap().is_none());
        let (stage, _) = fx.round.stage_info().await;
        assert_eq!(stage, ConsensusStage::WaitingForProposals);

        // Phase 1: both peers report (empty) data.
        assert!(fx
            .round
            .add_data_proposal(empty_proposal(round_id, node(2)))
            .await
            .unwrap()
            .is_none());
        assert!(fx
            .round
            .add_data_proposal(empty_proposal(round_id, node(3)))
            .await
            .unwrap()
            .is_none());
        let (stage, _) = fx.round.stage_info().await;
        assert_eq!(stage, ConsensusStage::WaitingForBlockProposals);

        // Phase 2: peers union the same content under their own keys.
        let our_union = next_union_block(&mut fx.peer2_rx);
        assert_eq!(our_union.transactions.len(), 5);

        let mut union2 = our_union.clone();
        union2.signatures.clear();
        union2.sign(&kp2).unwrap();
        let mut union3 = our_union.clone();
        union3.signatures.clear();
        union3.sign(&kp3).unwrap();
        assert_eq!(union2.base_hash(), our_union.base_hash());

        assert!(fx
            .round
            .add_block_proposal(UnionBlockProposal {
                round_id,
                facilitator: node(2),
                block: union2,
            })
            .await
            .unwrap()
            .is_none());
        assert!(fx
            .round
            .add_block_proposal(UnionBlockProposal {
                round_id,
                facilitator: node(3),
                block: union3,
            })
            .await
            .unwrap()
            .is_none());
        let (stage, _) = fx.round.stage_info().await;
        assert_eq!(stage, ConsensusStage::WaitingForSelectedBlocks);

        // Phase 3: everyone selects the merged block carrying all signers.
        let merged = next_selected_block(&mut fx.peer2_rx);
        assert_eq!(merged.signatures.len(), 3);

        assert!(fx
            .round
            .add_selected_block(SelectedUnionBlock {
                round_id,
                facilitator: node(2),
                block: merged.clone(),
            })
            .await
            .unwrap()
            .is_none());
        let outcome = fx
            .round
            .add_selected_block(SelectedUnionBlock {
                round_id,
                facilitator: node(3),
                block: merged.clone(),
            })
            .await
            .unwrap()
            .expect("round should finish");

        let accepted = outcome.accepted.expect("block should be accepted");
        assert_eq!(accepted.height, Some(1));
        assert_eq!(
            accepted.block.as_ref().unwrap().transactions.len(),
            5
        );
        assert!(outcome.transactions_to_return.is_empty());
        assert_eq!(fx.accepted_log.len(), 1);

        let (stage, _) = fx.round.stage_info().await;
        assert_eq!(stage, ConsensusStage::AcceptingMajorityCheckpointBlock);
    }

    #[tokio::test]
    async fn test_data_proposal_after_phase_one_is_previous_stage() {
        let mut fx = fixture(vec![]);
        let round_id = fx.round.round_id();

        fx.round.start().await.unwrap();
        fx.round
            .add_data_proposal(empty_proposal(round_id, node(2)))
            .await
            .unwrap();
        fx.round
            .add_data_proposal(empty_proposal(round_id, node(3)))
            .await
            .unwrap();

        // Phase 1 closed; a late proposal from a fourth party faults.
        let late = fx
            .round
            .add_data_proposal(empty_proposal(round_id, node(4)))
            .await;
        assert!(matches!(late, Err(RoundError::PreviousStage { .. })));
        // The union broadcast still went out.
        let _ = next_union_block(&mut fx.peer2_rx);
    }

    #[tokio::test]
    async fn test_duplicate_proposal_merges() {
        let fx = fixture(vec![]);
        let round_id = fx.round.round_id();
        fx.round.start().await.unwrap();

        let txs = chain_of(&Keypair::generate(), 2);
        let mut p = empty_proposal(round_id, node(2));
        p.transactions = vec![txs[0].clone()];
        fx.round.add_data_proposal(p.clone()).await.unwrap();

        // Redelivery with one more transaction unions, never duplicates.
        p.transactions = txs.clone();
        fx.round.add_data_proposal(p).await.unwrap();

        let (returned, _) = fx.round.data_to_return().await;
        assert_eq!(returned.len(), 2);
    }

    #[tokio::test]
    async fn test_force_union_below_threshold() {
        let fx = fixture(vec![]);
        fx.round.start().await.unwrap();

        // Only our own proposal present: 1 of 3 misses 51%.
        let result = fx.round.force_union().await;
        assert!(matches!(
            result,
            Err(RoundError::NotEnoughProposals { count: 1, total: 3 })
        ));
    }

    #[tokio::test]
    async fn test_force_union_at_threshold_proceeds() {
        let mut fx = fixture(chain_of(&Keypair::generate(), 2));
        let round_id = fx.round.round_id();
        fx.round.start().await.unwrap();
        fx.round
            .add_data_proposal(empty_proposal(round_id, node(2)))
            .await
            .unwrap();

        // 2 of 3 clears 51%: the union goes out without the third peer.
        fx.round.force_union().await.unwrap();
        let (stage, _) = fx.round.stage_info().await;
        assert_eq!(stage, ConsensusStage::WaitingForBlockProposals);
        let union = next_union_block(&mut fx.peer2_rx);
        assert_eq!(union.transactions.len(), 2);
    }

    #[tokio::test]
    async fn test_force_union_before_start_is_empty() {
        let fx = fixture(vec![]);
        let result = fx.round.force_union().await;
        assert!(matches!(result, Err(RoundError::EmptyProposals)));
    }

    #[tokio::test]
    async fn test_conflicting_majority_returns_rest() {
        // The majority block carries a transaction another block already
        // claimed; the round ends returning only the unconflicted data.
        let conflict_tx = chain_of(&Keypair::generate(), 1).remove(0);
        let ok_tx = chain_of(&Keypair::generate(), 1).remove(0);
        let mut fx = fixture(vec![conflict_tx.clone(), ok_tx.clone()]);
        let round_id = fx.round.round_id();
        let kp2 = Keypair::generate();
        let kp3 = Keypair::generate();

        fx.round.start().await.unwrap();
        fx.round
            .add_data_proposal(empty_proposal(round_id, node(2)))
            .await
            .unwrap();
        fx.round
            .add_data_proposal(empty_proposal(round_id, node(3)))
            .await
            .unwrap();

        let our_union = next_union_block(&mut fx.peer2_rx);
        let mut union2 = our_union.clone();
        union2.signatures.clear();
        union2.sign(&kp2).unwrap();
        let mut union3 = our_union.clone();
        union3.signatures.clear();
        union3.sign(&kp3).unwrap();
        fx.round
            .add_block_proposal(UnionBlockProposal {
                round_id,
                facilitator: node(2),
                block: union2,
            })
            .await
            .unwrap();
        fx.round
            .add_block_proposal(UnionBlockProposal {
                round_id,
                facilitator: node(3),
                block: union3,
            })
            .await
            .unwrap();
        let merged = next_selected_block(&mut fx.peer2_rx);

        // Meanwhile a competing block claims the conflicting transaction.
        let competing = CheckpointBlock::new(
            vec![conflict_tx.clone()],
            merged.parents.clone(),
            vec![],
            vec![],
            vec![H256::from_bytes([0xCC; 32])],
        );
        fx.acceptance
            .accept(CheckpointCache::new(competing), &[])
            .await
            .unwrap();

        fx.round
            .add_selected_block(SelectedUnionBlock {
                round_id,
                facilitator: node(2),
                block: merged.clone(),
            })
            .await
            .unwrap();
        let outcome = fx
            .round
            .add_selected_block(SelectedUnionBlock {
                round_id,
                facilitator: node(3),
                block: merged,
            })
            .await
            .unwrap()
            .expect("round should finish");

        assert!(outcome.accepted.is_none());
        let returned: Vec<H256> = outcome
            .transactions_to_return
            .iter()
            .map(|t| t.hash())
            .collect();
        assert!(returned.contains(&ok_tx.hash()));
        assert!(!returned.contains(&conflict_tx.hash()));
        // Only the competing block made it into the log.
        assert_eq!(fx.accepted_log.len(), 1);

        // Returned data re-enters the pool for the next round.
        fx.transactions_pool.put_back(outcome.transactions_to_return);
        assert_eq!(fx.transactions_pool.len(), 1);
    }

    #[tokio::test]
    async fn test_peer_data_becomes_reachable() {
        let fx = fixture(vec![]);
        let round_id = fx.round.round_id();
        fx.round.start().await.unwrap();

        let peer_tx = chain_of(&Keypair::generate(), 1).remove(0);
        let mut p = empty_proposal(round_id, node(2));
        p.transactions = vec![peer_tx.clone()];
        fx.round.add_data_proposal(p).await.unwrap();

        assert!(fx.transactions_pool.contains(&peer_tx.hash()));
        assert_eq!(
            fx.transactions_pool.lookup(&peer_tx.hash()).unwrap().status,
            TransactionStatus::Unknown
        );
    }

    #[tokio::test]
    async fn test_round_commits_at_most_one_block() {
        // Even with duplicate selected deliveries the round produces one
        // outcome; subsequent adds fault with PreviousStage.
        let mut fx = fixture(vec![]);
        let round_id = fx.round.round_id();
        let kp2 = Keypair::generate();
        let kp3 = Keypair::generate();

        fx.round.start().await.unwrap();
        fx.round
            .add_data_proposal(empty_proposal(round_id, node(2)))
            .await
            .unwrap();
        fx.round
            .add_data_proposal(empty_proposal(round_id, node(3)))
            .await
            .unwrap();
        let our_union = next_union_block(&mut fx.peer2_rx);
        for (peer, kp) in [(node(2), &kp2), (node(3), &kp3)] {
            let mut union = our_union.clone();
            union.signatures.clear();
            union.sign(kp).unwrap();
            fx.round
                .add_block_proposal(UnionBlockProposal {
                    round_id,
                    facilitator: peer,
                    block: union,
                })
                .await
                .unwrap();
        }
        let merged = next_selected_block(&mut fx.peer2_rx);
        fx.round
            .add_selected_block(SelectedUnionBlock {
                round_id,
                facilitator: node(2),
                block: merged.clone(),
            })
            .await
            .unwrap();
        let outcome = fx
            .round
            .add_selected_block(SelectedUnionBlock {
                round_id,
                facilitator: node(3),
                block: merged.clone(),
            })
            .await
            .unwrap();
        assert!(outcome.is_some());
        assert_eq!(fx.accepted_log.len(), 1);

        let replay = fx
            .round
            .add_selected_block(SelectedUnionBlock {
                round_id,
                facilitator: node(3),
                block: merged,
            })
            .await;
        assert!(matches!(replay, Err(RoundError::PreviousStage { .. })));
        assert_eq!(fx.accepted_log.len(), 1);
    }
}
