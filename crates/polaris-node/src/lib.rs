//! # polaris-node
//!
//! Node assembly for the Polaris ledger: configuration, genesis
//! bootstrap, service wiring, and the run loop.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cli;
pub mod config;
pub mod genesis;
pub mod node;
