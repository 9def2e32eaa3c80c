//! Duplicate suppression for at-least-once delivery

use crate::messages::{PeerMessage, ProposalPhase};
use parking_lot::Mutex;
use polaris_primitives::{NodeId, RoundId};
use std::collections::HashSet;

/// Tracks seen `(round, facilitator, phase)` keys so redelivered proposals
/// are dropped before they reach a round.
#[derive(Default)]
pub struct DedupFilter {
    seen: Mutex<HashSet<(RoundId, NodeId, ProposalPhase)>>,
}

impl DedupFilter {
    /// Create an empty filter
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message; returns `false` when it was already seen.
    ///
    /// Messages without a dedup key always pass.
    pub fn check(&self, message: &PeerMessage) -> bool {
        match message.dedup_key() {
            Some(key) => self.seen.lock().insert(key),
            None => true,
        }
    }

    /// Drop all keys of a finished round
    pub fn forget_round(&self, round_id: RoundId) {
        self.seen.lock().retain(|(r, _, _)| *r != round_id);
    }
}
