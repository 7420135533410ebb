//! Stored values and replication control

use crate::config::MAX_VALUE_LIFETIME;
use crate::contact::Contact;
use crate::db::diversify::DiversificationType;
use crate::node_id::NodeId;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Largest payload a put accepts; leaves room for the STORE envelope in
/// one datagram
pub const MAX_VALUE_SIZE: usize = 63 * 1024;

/// Replication control byte.
///
/// Low nibble is the number of acknowledgements a put needs (0 means 1),
/// high nibble the republish interval in hours (0 means the configured
/// default). `0xFF` is the default marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicationControl(pub u8);

impl ReplicationControl {
    /// Quorum 1, configured republish interval
    pub const DEFAULT: Self = Self(0xFF);

    /// Build from a quorum and a republish interval in hours, each 0..=15
    #[must_use]
    pub fn new(quorum: u8, republish_hours: u8) -> Self {
        Self((republish_hours.min(15) << 4) | quorum.min(15))
    }

    /// Acknowledgements required for a put to succeed
    #[must_use]
    pub fn quorum(self) -> usize {
        if self == Self::DEFAULT {
            return 1;
        }
        usize::from(self.0 & 0x0F).max(1)
    }

    /// Republish interval, or `default` when unspecified
    #[must_use]
    pub fn republish_interval(self, default: Duration) -> Duration {
        if self == Self::DEFAULT {
            return default;
        }
        match self.0 >> 4 {
            0 => default,
            hours => Duration::from_secs(u64::from(hours) * 60 * 60),
        }
    }
}

impl Default for ReplicationControl {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// One value stored under a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    /// Key the value lives under
    pub key: NodeId,
    /// Opaque payload; empty means "delete the originator's value"
    pub payload: Vec<u8>,
    /// Application flags
    pub flags: u8,
    /// Lifetime in hours; 0 means the maximum
    pub life_hours: u8,
    /// Replication control
    pub replication_control: ReplicationControl,
    /// Node that created the value
    pub originator: Contact,
    /// Creation time, milliseconds since the Unix epoch
    pub created_ms: u64,
    /// Per-originator version; higher replaces lower
    pub version: u32,
    /// Whether this node originated the value
    #[serde(skip)]
    pub local: bool,
    /// Diversification of the key when the value was returned
    #[serde(skip)]
    pub diversification: DiversificationType,
}

impl StoredValue {
    /// Time the value survives without a refresh, capped at the global maximum
    #[must_use]
    pub fn lifetime(&self) -> Duration {
        if self.life_hours == 0 {
            return MAX_VALUE_LIFETIME;
        }
        Duration::from_secs(u64::from(self.life_hours) * 60 * 60).min(MAX_VALUE_LIFETIME)
    }

    /// Whether this value deletes its originator's earlier value
    #[must_use]
    pub fn is_deletion(&self) -> bool {
        self.payload.is_empty()
    }

    /// Compact identity of (originator, version, payload), used by
    /// QUERY_STORE to ask whether a holder already has this exact value
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.originator.id.as_bytes());
        hasher.update(&self.version.to_be_bytes());
        hasher.update(&self.payload);
        let hash = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_be_bytes(bytes)
    }

    /// Total bytes the value accounts for in storage limits
    #[must_use]
    pub fn storage_size(&self) -> usize {
        // 4 bytes of bookkeeping so zero-length stores still count
        self.payload.len() + 4
    }
}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Seconds since the Unix epoch
#[must_use]
pub fn now_secs() -> u64 {
    now_ms() / 1000
}
