//! Error types for DHT operations
//!
//! Errors are split along the lines the rest of the system reacts to:
//!
//! - **Transient**: transport failures and missed quorums. Worth retrying.
//! - **Key-blocked**: an authenticated tombstone covers the key. Callers
//!   should stop retrying that key.
//! - **Permanent**: invalid configuration, destroyed instance, local I/O.
//!
//! Diversification is not an error; it is reported through
//! [`crate::control::PutResult`].

use crate::control::state::StateError;
use crate::db::key_block::KeyBlockError;
use crate::node_id::NodeId;
use crate::rpc::RpcError;
use kadmesh_transport::MuxError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors surfaced by the DHT
#[derive(Debug, Error)]
pub enum DhtError {
    /// Binding or multiplexer registration failed
    #[error("Transport error: {0}")]
    Mux(#[from] MuxError),

    /// A single RPC failed
    #[error("RPC failed: {0}")]
    Rpc(#[from] RpcError),

    /// Fewer STOREs succeeded than the replication control requires
    #[error("Quorum not reached: {acks} of {required} acknowledgements")]
    QuorumNotReached {
        /// Successful STOREs
        acks: usize,
        /// Required STOREs
        required: usize,
    },

    /// Payload does not fit in a single STORE
    #[error("Value of {size} bytes exceeds the {max} byte limit")]
    ValueTooLarge {
        /// Payload size
        size: usize,
        /// Largest accepted payload
        max: usize,
    },

    /// The key is covered by a valid key-block
    #[error("Key {key} is blocked")]
    KeyBlocked {
        /// Blocked key
        key: NodeId,
    },

    /// Key-block could not be applied
    #[error("Key-block rejected: {0}")]
    KeyBlock(#[from] KeyBlockError),

    /// Routing state export or import failed
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// The DHT has been destroyed
    #[error("DHT destroyed")]
    Destroyed,

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DhtError {
    /// Whether retrying later may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::QuorumNotReached { .. })
    }

    /// Whether the failure came from a key-block
    #[must_use]
    pub fn is_key_blocked(&self) -> bool {
        matches!(self, Self::KeyBlocked { .. })
    }
}

/// Result type for DHT operations
pub type Result<T> = std::result::Result<T, DhtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = DhtError::QuorumNotReached {
            acks: 2,
            required: 3,
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("2 of 3"));

        let err = DhtError::KeyBlocked {
            key: NodeId::ZERO,
        };
        assert!(err.is_key_blocked());
        assert!(!err.is_transient());

        let err = DhtError::ValueTooLarge { size: 70_000, max: 64_512 };
        assert!(!err.is_transient());
        assert!(err.to_string().contains("70000"));

        assert!(!DhtError::Destroyed.is_transient());
        assert!(DhtError::Rpc(RpcError::Closed).is_transient());
    }
}
