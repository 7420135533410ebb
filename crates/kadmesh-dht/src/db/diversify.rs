//! Key diversification
//!
//! A key that attracts too many distinct writers, or too much data, is
//! spread over [`DIV_WIDTH`] physical sub-keys. The decision is sticky: once
//! a key is diversified it stays that way. Frequency-diversified keys take
//! puts on every sub-key; size-diversified keys take puts on a fixed random
//! pair, so no single set of nodes holds all of the data. Gets always visit
//! every sub-key.
//!
//! The [`StorageAdapter`] is also where a node keeps what must outlive a
//! restart: diversification records, key-blocks and the value version
//! counter. [`LocalStorageAdapter`] keeps them in memory;
//! [`FileStorageAdapter`](super::storage::FileStorageAdapter) writes them to
//! disk.

use super::key_block::KeyBlock;
use super::value;
use crate::node_id::NodeId;
use rand::seq::index;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

/// Number of sub-keys a diversified key is spread over
pub const DIV_WIDTH: u8 = 10;

/// Sub-keys a size-diversified put writes to
pub const DIV_FRAG_GET_SIZE: usize = 2;

/// Why a key was diversified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DiversificationType {
    /// Not diversified
    #[default]
    None,
    /// Too many distinct sources wrote to the key
    Frequency,
    /// The key's value set grew too large
    Size,
}

/// A diversified key and where puts for it go
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diversification {
    /// Logical key
    pub key: NodeId,
    /// Trigger
    pub kind: DiversificationType,
    /// Physical keys that receive puts
    pub put_keys: Vec<NodeId>,
}

impl Diversification {
    /// Choose put targets for a newly diversified key
    #[must_use]
    pub fn new(key: NodeId, kind: DiversificationType) -> Self {
        let put_keys = match kind {
            DiversificationType::None => vec![key],
            DiversificationType::Frequency => sub_keys(&key),
            DiversificationType::Size => {
                let mut rng = rand::thread_rng();
                index::sample(&mut rng, usize::from(DIV_WIDTH), DIV_FRAG_GET_SIZE)
                    .into_iter()
                    .map(|i| key.sub_key(i as u8))
                    .collect()
            }
        };
        Self {
            key,
            kind,
            put_keys,
        }
    }

    /// Physical keys a get must visit
    #[must_use]
    pub fn get_keys(&self) -> Vec<NodeId> {
        match self.kind {
            DiversificationType::None => vec![self.key],
            _ => sub_keys(&self.key),
        }
    }
}

/// Every sub-key of `key`
#[must_use]
pub fn sub_keys(key: &NodeId) -> Vec<NodeId> {
    (0..DIV_WIDTH).map(|i| key.sub_key(i)).collect()
}

/// What the database reports to the adapter after accepting a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreEvent {
    /// Distinct sources seen for the key in the current window
    pub distinct_sources: u32,
    /// Bytes held under the key
    pub value_set_bytes: usize,
}

/// Thresholds for automatic diversification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiversificationPolicy {
    /// Distinct sources per window before a key is frequency-diversified
    pub max_sources: u32,
    /// Source counting window in seconds
    pub window_secs: u64,
    /// Value-set size before a key is size-diversified
    pub max_value_set_bytes: usize,
}

impl Default for DiversificationPolicy {
    fn default() -> Self {
        Self {
            max_sources: 20,
            window_secs: 10 * 60,
            max_value_set_bytes: 32 * 1024,
        }
    }
}

impl DiversificationPolicy {
    /// Trigger implied by `event`, if any
    #[must_use]
    pub fn evaluate(&self, event: &StoreEvent) -> Option<DiversificationType> {
        if event.distinct_sources > self.max_sources {
            Some(DiversificationType::Frequency)
        } else if event.value_set_bytes > self.max_value_set_bytes {
            Some(DiversificationType::Size)
        } else {
            None
        }
    }
}

/// Host-side storage policy consulted by the database and by puts
pub trait StorageAdapter: Send + Sync {
    /// Diversification already recorded for `key`
    fn get_existing_diversification(&self, key: &NodeId) -> Option<Diversification>;

    /// Record a new diversification for `key`.
    ///
    /// If the key is already diversified the existing record is returned
    /// unchanged.
    fn create_new_diversification(&self, key: &NodeId, kind: DiversificationType) -> Diversification;

    /// Called after the database accepted a store for `key`; returns the
    /// trigger if the key should now be diversified
    fn value_stored(&self, key: &NodeId, event: &StoreEvent) -> Option<DiversificationType>;

    /// Whether `key` is diversified
    fn is_diversified(&self, key: &NodeId) -> bool {
        self.get_existing_diversification(key).is_some()
    }

    /// Reserve `count` value versions and return the first.
    ///
    /// Versions must keep increasing across restarts of a node with the
    /// same id, or holders ignore its new values until the old ones expire.
    fn next_value_versions(&self, count: u32) -> u32;

    /// Key-blocks recorded by an earlier run
    fn key_blocks(&self) -> Vec<KeyBlock> {
        Vec::new()
    }

    /// Replace the recorded key-blocks
    fn set_key_blocks(&self, _blocks: &[KeyBlock]) {}
}

/// First version of a chunk: past every version already handed out and
/// no lower than the wall clock in seconds
pub(crate) fn version_floor(next: u32) -> u32 {
    let clock = u32::try_from(value::now_secs()).unwrap_or(u32::MAX);
    next.max(clock)
}

/// In-memory adapter applying a [`DiversificationPolicy`].
///
/// Nothing survives the process. Value versions start from the wall clock
/// so a restarted node still outranks its previous values, as long as it
/// issued fewer versions than seconds passed.
#[derive(Debug, Default)]
pub struct LocalStorageAdapter {
    policy: DiversificationPolicy,
    diversifications: Mutex<HashMap<NodeId, Diversification>>,
    next_version: AtomicU32,
}

impl LocalStorageAdapter {
    /// Create an adapter with `policy`
    #[must_use]
    pub fn new(policy: DiversificationPolicy) -> Self {
        Self {
            policy,
            diversifications: Mutex::new(HashMap::new()),
            next_version: AtomicU32::new(0),
        }
    }

    /// Number of diversified keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.diversifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Whether no key is diversified
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageAdapter for LocalStorageAdapter {
    fn get_existing_diversification(&self, key: &NodeId) -> Option<Diversification> {
        self.diversifications
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn create_new_diversification(&self, key: &NodeId, kind: DiversificationType) -> Diversification {
        let mut diversifications = self.diversifications.lock().unwrap_or_else(|e| e.into_inner());
        diversifications
            .entry(*key)
            .or_insert_with(|| {
                tracing::info!("Diversifying key {} ({:?})", key, kind);
                Diversification::new(*key, kind)
            })
            .clone()
    }

    fn value_stored(&self, _key: &NodeId, event: &StoreEvent) -> Option<DiversificationType> {
        self.policy.evaluate(event)
    }

    fn next_value_versions(&self, count: u32) -> u32 {
        let mut first = 0;
        let _ = self
            .next_version
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                first = version_floor(next);
                Some(first.saturating_add(count))
            });
        first
    }
}
