//! Round lifecycle management and peer message routing

use crate::error::{RoundError, RoundResult};
use crate::round::{Round, RoundConfig, RoundOutcome};
use dashmap::DashMap;
use parking_lot::Mutex;
use polaris_core::AcceptanceService;
use polaris_crypto::{sign_hash, Keypair};
use polaris_mempool::{PendingObservations, PendingTransactions, TransactionChainService};
use polaris_metrics::Metrics;
use polaris_network::{DedupFilter, PeerClient, PeerMessage};
use polaris_primitives::{NodeId, RoundId};
use polaris_storage::{CheckpointStorage, TipService};
use polaris_types::{
    ConsensusStage, HashSignature, LastTransactionRef, RoundData, Transaction,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Manager limits and timeouts
#[derive(Debug, Clone)]
pub struct ConsensusManagerConfig {
    /// Maximum rounds this node runs in parallel
    pub max_parallel_rounds: usize,
    /// Minimum delay between own-round starts, in milliseconds
    pub round_cooldown_ms: u64,
    /// Per-stage upper bound, in milliseconds
    pub stage_timeout_ms: u64,
    /// Whole-round upper bound, in milliseconds
    pub round_timeout_ms: u64,
    /// Watchdog tick, in milliseconds
    pub timeout_check_interval_ms: u64,
    /// Per-round limits
    pub round: RoundConfig,
}

impl Default for ConsensusManagerConfig {
    fn default() -> Self {
        Self {
            max_parallel_rounds: 3,
            round_cooldown_ms: 1_000,
            stage_timeout_ms: 10_000,
            round_timeout_ms: 30_000,
            timeout_check_interval_ms: 500,
            round: RoundConfig::default(),
        }
    }
}

/// Creates and destroys rounds, routes peer messages to them, enforces
/// timeouts, and returns failed rounds' data to the mempools.
pub struct ConsensusManager {
    node_id: NodeId,
    keypair: Arc<Keypair>,
    config: ConsensusManagerConfig,
    peers: Arc<dyn PeerClient>,
    storage: Arc<CheckpointStorage>,
    tips: Arc<TipService>,
    chain: Arc<TransactionChainService>,
    transactions_pool: Arc<PendingTransactions>,
    observations_pool: Arc<PendingObservations>,
    acceptance: Arc<AcceptanceService>,
    metrics: Arc<Metrics>,
    active: DashMap<RoundId, Arc<Round>>,
    /// Proposals that arrived before their StartConsensusRound
    buffered: Mutex<HashMap<RoundId, Vec<PeerMessage>>>,
    light_peers: Mutex<BTreeSet<NodeId>>,
    last_round_at: Mutex<Option<Instant>>,
    pool_member: AtomicBool,
    dedup: DedupFilter,
    /// Self-handle for the watchdog tasks
    weak: Weak<ConsensusManager>,
}

impl ConsensusManager {
    /// Wire up the manager
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        keypair: Arc<Keypair>,
        config: ConsensusManagerConfig,
        peers: Arc<dyn PeerClient>,
        storage: Arc<CheckpointStorage>,
        tips: Arc<TipService>,
        chain: Arc<TransactionChainService>,
        transactions_pool: Arc<PendingTransactions>,
        observations_pool: Arc<PendingObservations>,
        acceptance: Arc<AcceptanceService>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            node_id,
            keypair,
            config,
            peers,
            storage,
            tips,
            chain,
            transactions_pool,
            observations_pool,
            acceptance,
            metrics,
            active: DashMap::new(),
            buffered: Mutex::new(HashMap::new()),
            light_peers: Mutex::new(BTreeSet::new()),
            last_round_at: Mutex::new(None),
            pool_member: AtomicBool::new(true),
            dedup: DedupFilter::new(),
            weak: weak.clone(),
        })
    }

    /// Number of currently active rounds
    pub fn active_rounds(&self) -> usize {
        self.active.len()
    }

    /// Set the non-facilitator peers that receive finished checkpoints
    pub fn set_light_peers(&self, peers: BTreeSet<NodeId>) {
        *self.light_peers.lock() = peers;
    }

    /// Mark whether this node considers itself part of the active pool
    pub fn set_pool_member(&self, member: bool) {
        self.pool_member.store(member, Ordering::SeqCst);
    }

    /// Start a round of our own over the current tips.
    ///
    /// Silently declines (returns `Ok(None)`) when the parallel-round cap,
    /// the cooldown, or tip selection says no.
    pub async fn start_own_round(
        &self,
        ready_facilitators: &BTreeSet<NodeId>,
    ) -> RoundResult<Option<RoundId>> {
        if self.active.len() >= self.config.max_parallel_rounds {
            tracing::debug!("parallel round cap reached");
            return Ok(None);
        }
        {
            let last = self.last_round_at.lock();
            if let Some(at) = *last {
                if at.elapsed() < Duration::from_millis(self.config.round_cooldown_ms) {
                    return Ok(None);
                }
            }
        }

        let Some(pulled) = self.tips.pull(ready_facilitators) else {
            tracing::debug!("no tips available for a new round");
            return Ok(None);
        };

        let transactions = self
            .transactions_pool
            .pull_for_consensus(self.config.round.max_transaction_threshold);
        let observations = self
            .observations_pool
            .pull_for_consensus(self.config.round.max_observation_threshold);

        let round_data = RoundData {
            round_id: RoundId::generate(),
            peers: pulled
                .peers
                .iter()
                .copied()
                .filter(|id| *id != self.node_id)
                .collect(),
            light_peers: self.light_peers.lock().clone(),
            facilitator_id: self.node_id,
            transactions,
            observations,
            tips_soe: pulled.tips,
            messages: Vec::new(),
        };
        let round_id = round_data.round_id;

        self.peers
            .broadcast(
                &round_data.peers.iter().copied().collect::<Vec<_>>(),
                PeerMessage::StartConsensusRound(round_data.clone()),
            )
            .await
            .ok();

        let round = self.install_round(round_data);
        *self.last_round_at.lock() = Some(Instant::now());
        self.metrics.counter("consensus.rounds_started", 1);

        let result = round.start().await;
        self.apply_round_result(round_id, result).await;
        Ok(Some(round_id))
    }

    /// Handle one incoming peer message
    pub async fn handle_message(&self, from: NodeId, message: PeerMessage) {
        if !self.dedup.check(&message) {
            tracing::debug!(%from, "duplicate proposal suppressed");
            return;
        }

        match message {
            PeerMessage::StartConsensusRound(data) => self.on_round_start(data).await,
            PeerMessage::ConsensusDataProposal(_)
            | PeerMessage::UnionBlockProposal(_)
            | PeerMessage::SelectedUnionBlock(_) => self.route_proposal(message).await,
            PeerMessage::FinishedCheckpoint { cache, facilitators } => {
                let peers: Vec<NodeId> = facilitators.iter().copied().collect();
                match self.acceptance.accept(cache, &peers).await {
                    Ok(_) => {}
                    Err(err) if err.is_informational() => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "finished checkpoint failed acceptance");
                    }
                }
            }
            PeerMessage::SignatureRequest { block, .. } => {
                let response = self.answer_signature_request(&block);
                self.peers.send(from, response).await.ok();
            }
            PeerMessage::SignatureResponse { .. } => {
                // Responses are consumed by the requesting round; outside a
                // round they carry no state to apply.
                tracing::debug!(%from, "stray signature response");
            }
            PeerMessage::CheckpointRequest { soe_hash } => {
                let cache = self.storage.lookup(&soe_hash);
                self.peers
                    .send(from, PeerMessage::CheckpointResponse { cache })
                    .await
                    .ok();
            }
            PeerMessage::CheckpointResponse { .. } => {
                // Fetches resolve through PeerClient; a bare response here
                // means the request already timed out.
            }
        }
    }

    /// A peer opened a round with us as facilitator
    async fn on_round_start(&self, data: RoundData) {
        if self.active.contains_key(&data.round_id) {
            return;
        }

        // Our view of the facilitator set: the initiator joins, we leave.
        let mut peers: BTreeSet<NodeId> = data
            .peers
            .iter()
            .copied()
            .filter(|id| *id != self.node_id)
            .collect();
        peers.insert(data.facilitator_id);
        let round_data = RoundData { peers, ..data };
        let round_id = round_data.round_id;

        let round = self.install_round(round_data);
        self.metrics.counter("consensus.rounds_joined", 1);

        let result = round.start().await;
        self.apply_round_result(round_id, result).await;

        // Proposals that raced ahead of the round start.
        let pending = self.buffered.lock().remove(&round_id).unwrap_or_default();
        for message in pending {
            self.route_proposal(message).await;
        }
    }

    fn install_round(&self, round_data: RoundData) -> Arc<Round> {
        let round = Arc::new(Round::new(
            self.node_id,
            Arc::clone(&self.keypair),
            round_data,
            self.config.round.clone(),
            Arc::clone(&self.peers),
            Arc::clone(&self.acceptance),
            Arc::clone(&self.transactions_pool),
            Arc::clone(&self.observations_pool),
            Arc::clone(&self.metrics),
        ));
        self.active.insert(round.round_id(), Arc::clone(&round));
        self.spawn_watchdog(round.round_id());
        round
    }

    async fn route_proposal(&self, message: PeerMessage) {
        let Some(round_id) = message.round_id() else {
            return;
        };

        let Some(round) = self.active.get(&round_id).map(|r| Arc::clone(&r)) else {
            // Proposals may race ahead of StartConsensusRound; keep them
            // briefly. The caps stop dead rounds from pinning memory.
            let mut buffered = self.buffered.lock();
            if buffered.len() < 256 {
                let queue = buffered.entry(round_id).or_default();
                if queue.len() < 64 {
                    tracing::debug!(%round_id, "buffering proposal for unknown round");
                    queue.push(message);
                }
            }
            return;
        };

        let result = match message {
            PeerMessage::ConsensusDataProposal(p) => round.add_data_proposal(p).await,
            PeerMessage::UnionBlockProposal(p) => round.add_block_proposal(p).await,
            PeerMessage::SelectedUnionBlock(p) => round.add_selected_block(p).await,
            _ => Ok(None),
        };
        self.apply_round_result(round_id, result).await;
    }

    /// Fold a round-call result back into manager state
    async fn apply_round_result(
        &self,
        round_id: RoundId,
        result: RoundResult<Option<RoundOutcome>>,
    ) {
        match result {
            Ok(None) => {}
            Ok(Some(outcome)) => self.stop_round(round_id, outcome).await,
            Err(RoundError::PreviousStage { stage }) => {
                // Faults only the message, not the round.
                tracing::debug!(%round_id, %stage, "dropped proposal for passed stage");
            }
            Err(err) => self.handle_round_error(round_id, err).await,
        }
    }

    /// Destroy a finished round; accepted data leaves the pools, returned
    /// data re-enters them as `Unknown`.
    async fn stop_round(&self, round_id: RoundId, outcome: RoundOutcome) {
        self.active.remove(&round_id);
        self.dedup.forget_round(round_id);
        self.buffered.lock().remove(&round_id);

        if let Some(cache) = &outcome.accepted {
            if let Some(block) = &cache.block {
                self.transactions_pool.remove(&block.transaction_hashes());
                let obs_hashes: Vec<_> =
                    block.observations.iter().map(|o| o.hash()).collect();
                self.observations_pool.remove(&obs_hashes);
            }
            self.metrics.counter("consensus.rounds_finished", 1);
        } else {
            self.metrics.counter("consensus.rounds_finished_empty", 1);
        }

        self.transactions_pool
            .put_back(outcome.transactions_to_return);
        self.observations_pool
            .put_back(outcome.observations_to_return);
    }

    /// Destroy a failed round and return its data to the pools
    async fn handle_round_error(&self, round_id: RoundId, err: RoundError) {
        tracing::warn!(%round_id, error = %err, "round failed");
        self.metrics.counter("consensus.rounds_failed", 1);

        let Some((_, round)) = self.active.remove(&round_id) else {
            return;
        };
        self.dedup.forget_round(round_id);
        self.buffered.lock().remove(&round_id);

        let (transactions, observations) = round.data_to_return().await;
        self.transactions_pool.put_back(transactions);
        self.observations_pool.put_back(observations);
    }

    /// Per-round watchdog: forces a partial union on phase-1 expiry, fails
    /// the round on later-stage or whole-round expiry.
    fn spawn_watchdog(&self, round_id: RoundId) {
        let Some(manager) = self.weak.upgrade() else {
            return;
        };
        let started = Instant::now();
        tokio::spawn(async move {
            let tick = Duration::from_millis(manager.config.timeout_check_interval_ms);
            let stage_timeout = Duration::from_millis(manager.config.stage_timeout_ms);
            let round_timeout = Duration::from_millis(manager.config.round_timeout_ms);

            loop {
                tokio::time::sleep(tick).await;
                let Some(round) = manager.active.get(&round_id).map(|r| Arc::clone(&r))
                else {
                    break;
                };

                let (stage, age) = round.stage_info().await;
                let round_expired = started.elapsed() > round_timeout;
                if age <= stage_timeout && !round_expired {
                    continue;
                }

                if stage <= ConsensusStage::WaitingForProposals && !round_expired {
                    tracing::warn!(%round_id, %stage, "stage timeout, forcing union");
                    let result = round.force_union().await;
                    manager.apply_round_result(round_id, result).await;
                } else {
                    let (count, total) = round.phase_progress().await;
                    let err = if count == 0 {
                        RoundError::EmptyProposals
                    } else {
                        RoundError::NotEnoughProposals { count, total }
                    };
                    manager.handle_round_error(round_id, err).await;
                    break;
                }
            }
        });
    }

    /// Sign a block for a requesting peer, after checking our view of its
    /// transaction chains; decline with `re_register` when we no longer
    /// consider ourselves part of the pool.
    fn answer_signature_request(&self, block: &polaris_types::CheckpointBlock) -> PeerMessage {
        if !self.pool_member.load(Ordering::SeqCst) {
            return PeerMessage::SignatureResponse {
                signature: None,
                re_register: true,
            };
        }
        if !block.verify_signatures() || !self.chains_extend(&block.transactions) {
            return PeerMessage::SignatureResponse {
                signature: None,
                re_register: false,
            };
        }

        match sign_hash(&block.base_hash(), self.keypair.private()) {
            Ok(signature) => PeerMessage::SignatureResponse {
                signature: Some(HashSignature {
                    signer: self.node_id,
                    signature,
                }),
                re_register: false,
            },
            Err(err) => {
                tracing::warn!(error = %err, "failed to sign checkpoint");
                PeerMessage::SignatureResponse {
                    signature: None,
                    re_register: false,
                }
            }
        }
    }

    fn chains_extend(&self, transactions: &[Transaction]) -> bool {
        let mut per_sender: HashMap<_, Vec<&Transaction>> = HashMap::new();
        for tx in transactions {
            per_sender.entry(tx.sender).or_default().push(tx);
        }
        for (sender, mut txs) in per_sender {
            txs.sort_by_key(|tx| tx.ordinal);
            let mut expected = self.chain.get_last_accepted(&sender);
            for tx in txs {
                if tx.last_tx_ref != expected || tx.ordinal != expected.ordinal + 1 {
                    return false;
                }
                expected = LastTransactionRef {
                    hash: tx.hash(),
                    ordinal: tx.ordinal,
                };
            }
        }
        true
    }

    /// Stop every active round and return all pulled data to the pools
    pub async fn shutdown(&self) {
        let round_ids: Vec<RoundId> = self.active.iter().map(|r| *r.key()).collect();
        for round_id in round_ids {
            if let Some((_, round)) = self.active.remove(&round_id) {
                let (transactions, observations) = round.data_to_return().await;
                self.transactions_pool.put_back(transactions);
                self.observations_pool.put_back(observations);
            }
        }
        tracing::info!("consensus manager stopped");
    }
}
