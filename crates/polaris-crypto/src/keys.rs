//! Key material and node identity derivation

use crate::error::CryptoError;
use crate::keccak::keccak256;
use k256::ecdsa::{SigningKey, VerifyingKey};
use polaris_primitives::{Address, NodeId};

/// Private key (32 bytes)
pub type PrivateKey = SigningKey;

/// Public key on secp256k1
pub type PublicKey = VerifyingKey;

/// A node's signing keypair
#[derive(Clone)]
pub struct Keypair {
    private: PrivateKey,
}

impl Keypair {
    /// Generate a fresh random keypair
    pub fn generate() -> Self {
        Self {
            private: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Construct from raw private key bytes
    pub fn from_private_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let private =
            SigningKey::from_slice(bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self { private })
    }

    /// The private half
    pub fn private(&self) -> &PrivateKey {
        &self.private
    }

    /// The public half
    pub fn public(&self) -> PublicKey {
        *self.private.verifying_key()
    }

    /// Node identity for this keypair
    pub fn node_id(&self) -> NodeId {
        node_id_of(&self.public())
    }

    /// Ledger address for this keypair
    pub fn address(&self) -> Address {
        address_of(&self.public())
    }
}

/// Derive a node identity from a public key.
///
/// The identity is the keccak256 digest of the uncompressed key material,
/// so it is stable across encodings.
pub fn node_id_of(public_key: &PublicKey) -> NodeId {
    let encoded = public_key.to_encoded_point(false);
    let hash = keccak256(&encoded.as_bytes()[1..]);
    NodeId::from_bytes(*hash.as_bytes())
}

/// Derive a ledger address from a public key (last 20 bytes of the key digest)
pub fn address_of(public_key: &PublicKey) -> Address {
    let encoded = public_key.to_encoded_point(false);
    let hash = keccak256(&encoded.as_bytes()[1..]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&hash.as_bytes()[12..]);
    Address::from_bytes(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generate_distinct() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_ne!(a.node_id(), b.node_id());
    }

    #[test]
    fn test_node_id_stable() {
        let kp = Keypair::generate();
        assert_eq!(kp.node_id(), node_id_of(&kp.public()));
        assert_eq!(kp.node_id(), kp.node_id());
    }

    #[test]
    fn test_address_and_node_id_related() {
        let kp = Keypair::generate();
        let id = kp.node_id();
        let addr = kp.address();
        // Address is the low 20 bytes of the identity digest.
        assert_eq!(&id.as_bytes()[12..], addr.as_bytes());
    }

    #[test]
    fn test_from_private_bytes_roundtrip() {
        let kp = Keypair::generate();
        let bytes: [u8; 32] = kp.private().to_bytes().into();
        let restored = Keypair::from_private_bytes(&bytes).unwrap();
        assert_eq!(kp.node_id(), restored.node_id());
    }

    #[test]
    fn test_from_private_bytes_invalid() {
        assert!(Keypair::from_private_bytes(&[0u8; 32]).is_err());
    }
}
