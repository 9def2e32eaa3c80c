//! # polaris-network
//!
//! Peer messages and the transport seam for the Polaris ledger.
//!
//! This crate provides:
//! - The peer message set exchanged during consensus
//! - The `PeerClient` trait the core speaks through
//! - Duplicate suppression for at-least-once delivery
//! - An in-process loopback transport for tests and the devnet
//!
//! The real gossip/UDP transport lives outside the core; anything that can
//! deliver `PeerMessage`s at least once can sit behind `PeerClient`.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod client;
mod dedup;
mod error;
mod loopback;
mod messages;

pub use client::{CheckpointProvider, PeerClient};
pub use dedup::DedupFilter;
pub use error::{NetworkError, NetworkResult};
pub use loopback::{LoopbackHandle, LoopbackNetwork};
pub use messages::{PeerMessage, ProposalPhase};
