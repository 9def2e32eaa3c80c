//! Network error types

use polaris_primitives::NodeId;
use thiserror::Error;

/// Network errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The target peer is not reachable
    #[error("peer unavailable: {0}")]
    PeerUnavailable(NodeId),

    /// A send failed at the transport layer
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A request timed out
    #[error("request timed out after {0} ms")]
    Timeout(u64),
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
