//! Transaction types and per-sender chain references

use polaris_crypto::{keccak256, recover_signer, sign_hash, CryptoError, Keypair, Signature};
use polaris_primitives::{Address, NodeId, Ordinal, H256};
use serde::{Deserialize, Serialize};

/// Reference to the previous transaction in a sender's chain
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LastTransactionRef {
    /// Hash of the referenced transaction
    pub hash: H256,
    /// Ordinal of the referenced transaction
    pub ordinal: Ordinal,
}

impl LastTransactionRef {
    /// The genesis reference of an address: the digest of the address itself
    /// at ordinal zero. A sender's first transaction points here.
    pub fn genesis(address: &Address) -> Self {
        Self {
            hash: keccak256(address.as_bytes()),
            ordinal: 0,
        }
    }
}

/// A value transfer between two addresses, chained per sender by ordinal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender address
    pub sender: Address,
    /// Receiver address
    pub receiver: Address,
    /// Transferred amount
    pub amount: u128,
    /// Optional fee, biases consensus selection
    pub fee: Option<u128>,
    /// Strictly increasing per-sender sequence number
    pub ordinal: Ordinal,
    /// Reference to the sender's previous transaction (or genesis reference)
    pub last_tx_ref: LastTransactionRef,
    /// Sender signature over the content hash
    pub signature: Signature,
    /// Optional counter-party signature
    pub counter_signature: Option<Signature>,
}

impl Transaction {
    /// Build and sign a transaction.
    pub fn new(
        keypair: &Keypair,
        receiver: Address,
        amount: u128,
        fee: Option<u128>,
        ordinal: Ordinal,
        last_tx_ref: LastTransactionRef,
    ) -> Result<Self, CryptoError> {
        let mut tx = Self {
            sender: keypair.address(),
            receiver,
            amount,
            fee,
            ordinal,
            last_tx_ref,
            signature: Signature::ZERO,
            counter_signature: None,
        };
        tx.signature = sign_hash(&tx.hash(), keypair.private())?;
        Ok(tx)
    }

    /// Deterministic content hash. A pure function of every field except the
    /// signatures, so co-signing does not change identity.
    pub fn hash(&self) -> H256 {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(self.sender.as_bytes());
        buf.extend_from_slice(self.receiver.as_bytes());
        buf.extend_from_slice(&self.amount.to_le_bytes());
        match self.fee {
            Some(fee) => {
                buf.push(1);
                buf.extend_from_slice(&fee.to_le_bytes());
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&self.ordinal.to_le_bytes());
        buf.extend_from_slice(self.last_tx_ref.hash.as_bytes());
        buf.extend_from_slice(&self.last_tx_ref.ordinal.to_le_bytes());
        keccak256(&buf)
    }

    /// Fee with the unset case collapsed to zero
    pub fn fee_or_zero(&self) -> u128 {
        self.fee.unwrap_or(0)
    }

    /// Verify the sender signature over the content hash
    pub fn verify_signature(&self) -> bool {
        recover_signer(&self.hash(), &self.signature).is_ok()
    }

    /// The node identity that produced the sender signature, when recoverable
    pub fn signer(&self) -> Option<NodeId> {
        recover_signer(&self.hash(), &self.signature).ok()
    }
}

/// Where a transaction sits in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Seen but not yet selected
    #[default]
    Unknown,
    /// Waiting in the mempool
    Pending,
    /// Selected into an active consensus round
    InConsensus,
    /// Included in an accepted checkpoint block
    Accepted,
}

/// A transaction together with its lifecycle status
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionCacheData {
    /// The transaction itself
    pub transaction: Transaction,
    /// Current lifecycle status
    pub status: TransactionStatus,
}

impl TransactionCacheData {
    /// Wrap a transaction with `Unknown` status
    pub fn unknown(transaction: Transaction) -> Self {
        Self {
            transaction,
            status: TransactionStatus::Unknown,
        }
    }
}
