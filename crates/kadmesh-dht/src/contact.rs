//! Remote node contacts

use crate::node_id::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Protocol version spoken by this implementation
pub const PROTOCOL_VERSION: u8 = 3;

/// Oldest protocol version still accepted
pub const MIN_PROTOCOL_VERSION: u8 = 2;

/// A node as seen from the network.
///
/// `spoof_token` is the token the node issued to us in a FIND_NODE reply;
/// it is local knowledge and never serialized.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Node identifier
    pub id: NodeId,
    /// Transport address
    pub addr: SocketAddr,
    /// Protocol version the node speaks
    pub version: u8,
    /// Random id chosen at node start; a change means the node restarted
    pub instance_id: u32,
    /// Whether the node reported itself as sleeping
    pub sleeping: bool,
    /// Anti-spoof token issued by this node to us
    #[serde(skip)]
    pub spoof_token: Option<u32>,
}

impl Contact {
    /// Create a contact speaking the current protocol version
    #[must_use]
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            version: PROTOCOL_VERSION,
            instance_id: 0,
            sleeping: false,
            spoof_token: None,
        }
    }

    /// Set the instance id
    #[must_use]
    pub fn with_instance(mut self, instance_id: u32) -> Self {
        self.instance_id = instance_id;
        self
    }

    /// Placeholder for a bootstrap address whose node id is not yet known
    #[must_use]
    pub fn placeholder(addr: SocketAddr) -> Self {
        Self::new(NodeId::from_address(&addr), addr)
    }

    /// Whether the contact's protocol version is still supported
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.version >= MIN_PROTOCOL_VERSION
    }
}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Contact({} @ {} v{})", self.id, self.addr, self.version)
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}
