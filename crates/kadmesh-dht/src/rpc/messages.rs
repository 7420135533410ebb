//! RPC wire messages
//!
//! Every datagram body is a bincode-encoded [`Packet`]: a transaction id
//! correlating request and reply, the sender's protocol version, the
//! sender's contact and either a [`Request`] or a [`Reply`]. The network id
//! prefix is added and stripped by the multiplexer.

use crate::contact::Contact;
use crate::db::diversify::Diversification;
use crate::db::key_block::KeyBlock;
use crate::db::value::StoredValue;
use crate::node_id::NodeId;
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Largest packet body accepted for decoding
pub const MAX_PACKET_SIZE: u64 = 64 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_PACKET_SIZE)
        .with_fixint_encoding()
}

/// Message encoding errors
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// Encoding failed or exceeded the size limit
    #[error("Encode failed: {0}")]
    Encode(String),

    /// Decoding failed
    #[error("Decode failed: {0}")]
    Decode(String),
}

/// RPC action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Liveness probe
    Ping,
    /// Value storage
    Store,
    /// Closest-contact query
    FindNode,
    /// Value query
    FindValue,
    /// Key-block distribution
    KeyBlock,
    /// Ask which values a holder lacks
    QueryStore,
    /// Remote statistics
    Stats,
}

impl RequestKind {
    /// Every kind, in counter order
    pub const ALL: [RequestKind; 7] = [
        Self::Ping,
        Self::Store,
        Self::FindNode,
        Self::FindValue,
        Self::KeyBlock,
        Self::QueryStore,
        Self::Stats,
    ];

    /// Position in [`RequestKind::ALL`]
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Short lowercase name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Store => "store",
            Self::FindNode => "find_node",
            Self::FindValue => "find_value",
            Self::KeyBlock => "key_block",
            Self::QueryStore => "query_store",
            Self::Stats => "stats",
        }
    }
}

/// Request bodies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Liveness probe
    Ping,
    /// Store values; `spoof_token` is the token the receiver issued to us
    Store {
        /// Anti-spoof token
        spoof_token: u32,
        /// Values, possibly under several keys
        values: Vec<StoredValue>,
    },
    /// Contacts closest to `target`
    FindNode {
        /// Lookup target
        target: NodeId,
    },
    /// Values under `key`, or closest contacts if none
    FindValue {
        /// Key
        key: NodeId,
        /// Value limit; 0 means all
        max_values: u16,
    },
    /// Apply a key-block
    KeyBlock(KeyBlock),
    /// Which of these (key, fingerprint) pairs does the receiver lack
    QueryStore {
        /// Entries to check
        entries: Vec<(NodeId, u64)>,
    },
    /// Remote statistics
    Stats,
}

impl Request {
    /// Action of this request
    #[must_use]
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Ping => RequestKind::Ping,
            Self::Store { .. } => RequestKind::Store,
            Self::FindNode { .. } => RequestKind::FindNode,
            Self::FindValue { .. } => RequestKind::FindValue,
            Self::KeyBlock(_) => RequestKind::KeyBlock,
            Self::QueryStore { .. } => RequestKind::QueryStore,
            Self::Stats => RequestKind::Stats,
        }
    }
}

/// Outcome of a STORE at the receiver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOutcome {
    /// Stored; lists the keys that are diversified at the receiver
    Accepted {
        /// Diversified keys among those stored
        diversified: Vec<Diversification>,
    },
    /// A key is covered by this key-block
    Blocked(KeyBlock),
    /// Receiver is sleeping or suspended
    Refused,
    /// Anti-spoof token did not match
    SpoofRejected,
}

/// Outcome of a FIND_VALUE at the receiver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FindValueReply {
    /// Values held under the key
    Found {
        /// Values, possibly empty when only a diversification is known
        values: Vec<StoredValue>,
        /// Diversification of the key at the receiver
        diversification: Option<Diversification>,
    },
    /// No values; closer contacts instead
    NotFound {
        /// Receiver's closest contacts to the key
        contacts: Vec<Contact>,
    },
    /// The key is blocked
    Blocked(KeyBlock),
}

/// Remote node statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStats {
    /// Keys in the remote database
    pub db_keys: u64,
    /// Values in the remote database
    pub db_values: u64,
    /// Routing table size
    pub contacts: u64,
    /// Seconds since the node started
    pub uptime_secs: u64,
}

/// Error replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Requester's protocol version is too old
    UnsupportedVersion {
        /// Oldest version accepted
        min: u8,
    },
    /// Receiver cannot serve requests right now
    Unavailable,
    /// Request could not be interpreted
    Malformed,
}

/// Reply bodies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// Answer to PING
    Pong,
    /// Answer to STORE
    Store(StoreOutcome),
    /// Answer to FIND_NODE, carrying a fresh anti-spoof token for the
    /// requester
    FindNode {
        /// Closest contacts
        contacts: Vec<Contact>,
        /// Token the requester must present on STORE
        spoof_token: u32,
    },
    /// Answer to FIND_VALUE
    FindValue(FindValueReply),
    /// Answer to KEY_BLOCK
    KeyBlock {
        /// Whether the block verified and was applied
        accepted: bool,
    },
    /// Answer to QUERY_STORE: indexes of the entries the receiver lacks
    QueryStore {
        /// Missing entry indexes
        missing: Vec<u32>,
    },
    /// Answer to STATS
    Stats(RemoteStats),
    /// Request rejected
    Error(ErrorCode),
}

/// Request or reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    /// Request
    Request(Request),
    /// Reply
    Reply(Reply),
}

/// One datagram body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Correlates a reply with its request
    pub transaction_id: u64,
    /// Sender's protocol version
    pub protocol_version: u8,
    /// Sender's contact as it describes itself
    pub sender: Contact,
    /// Payload
    pub body: Body,
}

impl Packet {
    /// Encode for the wire
    ///
    /// # Errors
    ///
    /// Returns `MessageError::Encode` if the packet exceeds
    /// [`MAX_PACKET_SIZE`]
    pub fn to_bytes(&self) -> Result<Vec<u8>, MessageError> {
        bincode_options()
            .serialize(self)
            .map_err(|e| MessageError::Encode(e.to_string()))
    }

    /// Decode from the wire
    ///
    /// # Errors
    ///
    /// Returns `MessageError::Decode` for malformed or oversized input
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        bincode_options()
            .deserialize(bytes)
            .map_err(|e| MessageError::Decode(e.to_string()))
    }
}
