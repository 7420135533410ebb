//! Node identifiers and the XOR distance metric
//!
//! A [`NodeId`] is a 256-bit identifier. The same key space addresses both
//! nodes and stored values, and closeness is measured with XOR distance.

use blake3::Hasher;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Length of a node identifier in bytes
pub const ID_LEN: usize = 32;

/// 256-bit identifier for nodes and keys
///
/// The derived ordering is plain byte order, which is also numeric order of
/// the XOR distance when a `NodeId` holds a distance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    /// Number of bits in a NodeId
    pub const BITS: usize = ID_LEN * 8;

    /// The all-zero identifier
    pub const ZERO: NodeId = NodeId([0u8; ID_LEN]);

    /// Generate a random NodeId
    ///
    /// # Examples
    ///
    /// ```
    /// use kadmesh_dht::NodeId;
    ///
    /// assert_ne!(NodeId::random(), NodeId::random());
    /// ```
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Hash arbitrary bytes into the key space with BLAKE3
    ///
    /// # Examples
    ///
    /// ```
    /// use kadmesh_dht::NodeId;
    ///
    /// let key = NodeId::hash(b"ubuntu-24.04.iso");
    /// assert_eq!(key, NodeId::hash(b"ubuntu-24.04.iso"));
    /// ```
    #[must_use]
    pub fn hash(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Deterministic identifier for a transport address.
    ///
    /// Used for bootstrap contacts whose real ID is not known until they
    /// answer.
    #[must_use]
    pub fn from_address(addr: &SocketAddr) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(b"kadmesh-address-id");
        match addr {
            SocketAddr::V4(v4) => hasher.update(&v4.ip().octets()),
            SocketAddr::V6(v6) => hasher.update(&v6.ip().octets()),
        };
        hasher.update(&addr.port().to_be_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Physical sub-key `offset` of a diversified key
    #[must_use]
    pub fn sub_key(&self, offset: u8) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(&self.0);
        hasher.update(&[offset]);
        Self(*hasher.finalize().as_bytes())
    }

    /// XOR distance to another NodeId
    ///
    /// # Examples
    ///
    /// ```
    /// use kadmesh_dht::NodeId;
    ///
    /// let id1 = NodeId::from_bytes([1u8; 32]);
    /// let id2 = NodeId::from_bytes([2u8; 32]);
    /// assert_eq!(id1.distance(&id2).as_bytes()[0], 3);
    /// ```
    #[must_use]
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut result = [0u8; ID_LEN];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(result)
    }

    /// Count leading zero bits (0-256)
    #[must_use]
    pub fn leading_zeros(&self) -> usize {
        let mut count = 0;
        for byte in &self.0 {
            if *byte == 0 {
                count += 8;
            } else {
                count += byte.leading_zeros() as usize;
                break;
            }
        }
        count
    }

    /// Number of leading bits shared with `other`
    #[must_use]
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        self.distance(other).leading_zeros()
    }

    /// Bit at `index`, counting from the most significant bit
    #[must_use]
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < Self::BITS);
        (self.0[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Copy of this id with bit `index` set to `value`
    #[must_use]
    pub fn with_bit(&self, index: usize, value: bool) -> NodeId {
        let mut bytes = self.0;
        let mask = 1u8 << (7 - index % 8);
        if value {
            bytes[index / 8] |= mask;
        } else {
            bytes[index / 8] &= !mask;
        }
        NodeId(bytes)
    }

    /// Random id sharing the first `depth` bits of `prefix`
    #[must_use]
    pub fn random_in_prefix(prefix: &NodeId, depth: usize) -> NodeId {
        let random = NodeId::random();
        let mut bytes = [0u8; ID_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let bit_start = i * 8;
            let mask = if depth >= bit_start + 8 {
                0xFF
            } else if depth <= bit_start {
                0x00
            } else {
                0xFFu8 << (8 - (depth - bit_start))
            };
            *byte = (prefix.0[i] & mask) | (random.0[i] & !mask);
        }
        NodeId(bytes)
    }

    /// Raw bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Create from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex string
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let bytes: [u8; ID_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Full hex encoding
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}
