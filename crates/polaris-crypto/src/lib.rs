//! # polaris-crypto
//!
//! Cryptographic primitives for the Polaris ledger.
//!
//! - Keccak-256 hashing
//! - ECDSA signing/verification (secp256k1)
//! - Public key recovery
//! - Node identity derivation

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod keccak;
mod keys;
mod signature;

pub use error::CryptoError;
pub use keccak::keccak256;
pub use keys::{Keypair, PrivateKey, PublicKey};
pub use signature::{recover_signer, sign_hash, verify_hash, Signature};
