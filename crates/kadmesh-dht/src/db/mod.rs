//! Value database
//!
//! Holds values this node originated and values other nodes stored here,
//! grouped by key. Remote values are bounded in total size, expire after
//! their lifetime without a refresh, and are counted per source so that hot
//! keys can be diversified. Key-blocks suppress a key entirely.

pub mod diversify;
pub mod key_block;
pub mod storage;
pub mod value;

use crate::bloom::{BloomFilter, FilterKind};
use crate::config::DhtConfig;
use crate::contact::Contact;
use crate::error::DhtError;
use crate::node_id::NodeId;
use crate::rpc::messages::StoreOutcome;
use diversify::{Diversification, DiversificationType, StorageAdapter, StoreEvent};
use ed25519_dalek::VerifyingKey;
use key_block::{KeyBlock, KeyBlockError};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use value::{ReplicationControl, StoredValue};

/// Value versions reserved from the storage adapter at a time
pub const VALUE_VERSION_CHUNK: u32 = 128;

/// Database counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbStats {
    /// Keys with at least one value
    pub keys: usize,
    /// Remote values held
    pub remote_values: usize,
    /// Values this node originated
    pub local_values: usize,
    /// Bytes of remote values
    pub remote_bytes: usize,
    /// Key-blocks in force
    pub key_blocks: usize,
}

/// Result of a database read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbLookup {
    /// Values held (possibly none) and the key's diversification
    Values {
        /// Most recent first
        values: Vec<StoredValue>,
        /// Diversification recorded for the key
        diversification: Option<Diversification>,
    },
    /// The key is blocked
    Blocked(KeyBlock),
}

#[derive(Debug)]
struct Entry {
    value: StoredValue,
    refreshed: Instant,
}

#[derive(Debug)]
struct Mapping {
    local: Option<StoredValue>,
    remote: HashMap<NodeId, Entry>,
    sources: BloomFilter,
}

impl Mapping {
    fn new(source_cells: u32) -> Result<Self, DhtError> {
        let sources = BloomFilter::new(FilterKind::Counting, source_cells)
            .map_err(|e| DhtError::InvalidConfig(e.to_string().into()))?;
        Ok(Self {
            local: None,
            remote: HashMap::new(),
            sources,
        })
    }

    fn remote_bytes(&self) -> usize {
        self.remote.values().map(|e| e.value.storage_size()).sum()
    }

    fn is_empty(&self) -> bool {
        self.local.is_none() && self.remote.is_empty()
    }
}

struct DbState {
    mappings: HashMap<NodeId, Mapping>,
    key_blocks: HashMap<NodeId, KeyBlock>,
    remote_bytes: usize,
    next_version: u32,
    version_limit: u32,
    window_started: Instant,
    sleeping: bool,
    suspended: bool,
}

/// The value database
pub struct Database {
    state: Mutex<DbState>,
    adapter: Arc<dyn StorageAdapter>,
    authority: Option<VerifyingKey>,
    max_bytes: usize,
    max_values_per_source: u32,
    source_window: Duration,
    source_cells: u32,
}

impl Database {
    /// Create an empty database
    ///
    /// # Errors
    ///
    /// Returns `DhtError::InvalidConfig` for an unparseable key-block
    /// authority
    pub fn new(config: &DhtConfig, adapter: Arc<dyn StorageAdapter>) -> Result<Self, DhtError> {
        let policy = &config.diversification;
        let authority = config.key_block_authority()?;
        let now_secs = value::now_secs();
        let key_blocks: HashMap<NodeId, KeyBlock> = match &authority {
            Some(authority) => adapter
                .key_blocks()
                .into_iter()
                .filter(|b| b.validate(authority, now_secs).is_ok())
                .map(|b| (b.key, b))
                .collect(),
            None => HashMap::new(),
        };
        if !key_blocks.is_empty() {
            tracing::debug!("Restored {} key-blocks", key_blocks.len());
        }
        Ok(Self {
            state: Mutex::new(DbState {
                mappings: HashMap::new(),
                key_blocks,
                remote_bytes: 0,
                next_version: 0,
                version_limit: 0,
                window_started: Instant::now(),
                sleeping: false,
                suspended: false,
            }),
            adapter,
            authority,
            max_bytes: config.max_db_bytes,
            max_values_per_source: config.max_values_per_source,
            source_window: Duration::from_secs(policy.window_secs),
            source_cells: policy.max_sources.max(16).saturating_mul(10),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DbState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_version(&self, state: &mut DbState) -> u32 {
        if state.next_version >= state.version_limit {
            state.next_version = self.adapter.next_value_versions(VALUE_VERSION_CHUNK);
            state.version_limit = state.next_version.saturating_add(VALUE_VERSION_CHUNK);
        }
        let version = state.next_version;
        state.next_version = state.next_version.saturating_add(1);
        version
    }

    fn save_key_blocks(&self, state: &DbState) {
        let blocks: Vec<KeyBlock> = state.key_blocks.values().cloned().collect();
        self.adapter.set_key_blocks(&blocks);
    }

    /// Storage adapter in use
    #[must_use]
    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    /// Record a value originated by this node and return it for
    /// replication.
    ///
    /// Each call takes a fresh version, so the new value replaces the
    /// previous one wherever it lands.
    pub fn store_local(
        &self,
        key: NodeId,
        payload: Vec<u8>,
        flags: u8,
        life_hours: u8,
        replication_control: ReplicationControl,
        originator: &Contact,
    ) -> StoredValue {
        let mut state = self.lock();
        let version = self.take_version(&mut state);

        let value = StoredValue {
            key,
            payload,
            flags,
            life_hours,
            replication_control,
            originator: originator.clone(),
            created_ms: value::now_ms(),
            version,
            local: true,
            diversification: DiversificationType::None,
        };

        let source_cells = self.source_cells;
        if !state.mappings.contains_key(&key) {
            match Mapping::new(source_cells) {
                Ok(mapping) => {
                    state.mappings.insert(key, mapping);
                }
                Err(e) => tracing::warn!("Cannot create mapping for {}: {}", key, e),
            }
        }
        if let Some(mapping) = state.mappings.get_mut(&key) {
            mapping.local = Some(value.clone());
        }
        value
    }

    /// Drop this node's value under `key`; returns the deletion value to
    /// propagate to holders
    pub fn remove_local(&self, key: &NodeId) -> Option<StoredValue> {
        let mut state = self.lock();
        let version = self.take_version(&mut state);

        let mapping = state.mappings.get_mut(key)?;
        let mut removed = mapping.local.take()?;
        if mapping.is_empty() {
            state.mappings.remove(key);
        }
        removed.payload.clear();
        removed.version = version;
        removed.created_ms = value::now_ms();
        Some(removed)
    }

    /// This node's value under `key`
    #[must_use]
    pub fn local_value(&self, key: &NodeId) -> Option<StoredValue> {
        self.lock()
            .mappings
            .get(key)
            .and_then(|m| m.local.clone())
    }

    /// Every value this node originated
    #[must_use]
    pub fn local_values(&self) -> Vec<StoredValue> {
        self.lock()
            .mappings
            .values()
            .filter_map(|m| m.local.clone())
            .collect()
    }

    /// Every remote value held, for cache republish and diagnostics
    #[must_use]
    pub fn stored_values(&self) -> Vec<StoredValue> {
        self.lock()
            .mappings
            .values()
            .flat_map(|m| m.remote.values().map(|e| e.value.clone()))
            .collect()
    }

    /// Apply a STORE from `sender`, observed at `source`
    pub fn store_remote(
        &self,
        sender: &Contact,
        source: SocketAddr,
        values: Vec<StoredValue>,
    ) -> StoreOutcome {
        let mut state = self.lock();
        if state.sleeping || state.suspended {
            return StoreOutcome::Refused;
        }

        let now = Instant::now();
        let now_secs = value::now_secs();
        for value in &values {
            if let Some(block) = live_block(&mut state, &value.key, now_secs) {
                return StoreOutcome::Blocked(block);
            }
        }

        let incoming: usize = values.iter().map(StoredValue::storage_size).sum();
        if state.remote_bytes + incoming > self.max_bytes {
            tracing::debug!(
                "Not storing {} values from {}: storage limit reached",
                values.len(),
                sender
            );
            let mut keys: Vec<NodeId> = values.iter().map(|v| v.key).collect();
            keys.dedup();
            let diversified = keys
                .into_iter()
                .map(|key| Diversification::new(key, DiversificationType::Size))
                .collect();
            return StoreOutcome::Accepted { diversified };
        }

        if now.saturating_duration_since(state.window_started) >= self.source_window {
            for mapping in state.mappings.values_mut() {
                mapping.sources.clear();
            }
            state.window_started = now;
        }

        let source_key = source_key(&source);
        let mut touched: Vec<NodeId> = Vec::new();
        for value in values {
            let key = value.key;
            if !state.mappings.contains_key(&key) {
                match Mapping::new(self.source_cells) {
                    Ok(mapping) => {
                        state.mappings.insert(key, mapping);
                    }
                    Err(e) => {
                        tracing::warn!("Cannot create mapping for {}: {}", key, e);
                        continue;
                    }
                }
            }
            let Some(mapping) = state.mappings.get_mut(&key) else {
                continue;
            };

            let prior = mapping.sources.count(&source_key);
            if prior >= self.max_values_per_source {
                tracing::trace!("Source {} over per-key limit for {}", source, key);
                continue;
            }
            mapping.sources.add(&source_key);

            let before = mapping.remote_bytes();
            apply_remote(mapping, value, now);
            let after = mapping.remote_bytes();
            state.remote_bytes = state.remote_bytes + after - before;
            if !touched.contains(&key) {
                touched.push(key);
            }
        }

        let mut diversified = Vec::new();
        for key in touched {
            let Some(mapping) = state.mappings.get(&key) else {
                continue;
            };
            let event = StoreEvent {
                distinct_sources: mapping.sources.entry_count(),
                value_set_bytes: mapping.remote_bytes(),
            };
            if mapping.is_empty() {
                state.mappings.remove(&key);
            }

            if let Some(existing) = self.adapter.get_existing_diversification(&key) {
                diversified.push(existing);
            } else if let Some(kind) = self.adapter.value_stored(&key, &event) {
                diversified.push(self.adapter.create_new_diversification(&key, kind));
            }
        }
        StoreOutcome::Accepted { diversified }
    }

    /// Values under `key`, most recent first. `max_values` of 0 means all.
    #[must_use]
    pub fn get(&self, key: &NodeId, max_values: usize) -> DbLookup {
        let mut state = self.lock();
        if let Some(block) = live_block(&mut state, key, value::now_secs()) {
            return DbLookup::Blocked(block);
        }

        let diversification = self.adapter.get_existing_diversification(key);
        let mut values: Vec<StoredValue> = state
            .mappings
            .get(key)
            .map(|m| {
                m.local
                    .iter()
                    .cloned()
                    .chain(m.remote.values().map(|e| e.value.clone()))
                    .filter(|v| !v.is_deletion())
                    .collect()
            })
            .unwrap_or_default();
        values.sort_by(|a, b| b.created_ms.cmp(&a.created_ms));
        if max_values > 0 {
            values.truncate(max_values);
        }
        let kind = diversification
            .as_ref()
            .map_or(DiversificationType::None, |d| d.kind);
        for value in &mut values {
            value.diversification = kind;
        }
        DbLookup::Values {
            values,
            diversification,
        }
    }

    /// Validate and apply a key-block; returns whether it was new
    ///
    /// # Errors
    ///
    /// - `KeyBlockError::NoAuthority` when no authority is configured
    /// - signature and expiry failures from [`KeyBlock::validate`]
    pub fn apply_key_block(&self, block: KeyBlock) -> Result<bool, KeyBlockError> {
        let authority = self.authority.as_ref().ok_or(KeyBlockError::NoAuthority)?;
        block.validate(authority, value::now_secs())?;

        let mut state = self.lock();
        if let Some(mapping) = state.mappings.remove(&block.key) {
            let bytes = mapping.remote_bytes();
            state.remote_bytes = state.remote_bytes.saturating_sub(bytes);
        }
        let key = block.key;
        let is_new = state
            .key_blocks
            .get(&key)
            .is_none_or(|existing| existing.created_secs < block.created_secs);
        if is_new {
            tracing::info!("Applied key-block for {}", key);
            state.key_blocks.insert(key, block);
            self.save_key_blocks(&state);
        }
        Ok(is_new)
    }

    /// Key-block in force for `key`
    #[must_use]
    pub fn key_block(&self, key: &NodeId) -> Option<KeyBlock> {
        live_block(&mut self.lock(), key, value::now_secs())
    }

    /// Every key-block in force
    #[must_use]
    pub fn key_blocks(&self) -> Vec<KeyBlock> {
        let now_secs = value::now_secs();
        self.lock()
            .key_blocks
            .values()
            .filter(|b| !b.is_expired(now_secs))
            .cloned()
            .collect()
    }

    /// Indexes of the `(key, fingerprint)` entries this node does not hold
    #[must_use]
    pub fn query_store(&self, entries: &[(NodeId, u64)]) -> Vec<u32> {
        let state = self.lock();
        entries
            .iter()
            .enumerate()
            .filter(|(_, (key, fingerprint))| {
                !state.mappings.get(key).is_some_and(|m| {
                    m.remote
                        .values()
                        .any(|e| e.value.fingerprint() == *fingerprint)
                        || m.local.as_ref().is_some_and(|v| v.fingerprint() == *fingerprint)
                })
            })
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Drop remote values past their lifetime and expired key-blocks;
    /// returns the number of values removed
    pub fn expire(&self, now: Instant) -> usize {
        let now_secs = value::now_secs();
        let mut state = self.lock();
        let mut removed = 0;
        let mut freed = 0;

        state.mappings.retain(|_, mapping| {
            mapping.remote.retain(|_, entry| {
                let alive = now.saturating_duration_since(entry.refreshed) < entry.value.lifetime();
                if !alive {
                    removed += 1;
                    freed += entry.value.storage_size();
                }
                alive
            });
            !mapping.is_empty()
        });
        let blocks = state.key_blocks.len();
        state.key_blocks.retain(|_, block| !block.is_expired(now_secs));
        if state.key_blocks.len() != blocks {
            self.save_key_blocks(&state);
        }
        state.remote_bytes = state.remote_bytes.saturating_sub(freed);

        if removed > 0 {
            tracing::debug!("Expired {} values", removed);
        }
        removed
    }

    /// Refuse remote stores while sleeping
    pub fn set_sleeping(&self, sleeping: bool) {
        self.lock().sleeping = sleeping;
    }

    /// Refuse remote stores while suspended
    pub fn set_suspended(&self, suspended: bool) {
        self.lock().suspended = suspended;
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> DbStats {
        let state = self.lock();
        DbStats {
            keys: state.mappings.len(),
            remote_values: state.mappings.values().map(|m| m.remote.len()).sum(),
            local_values: state.mappings.values().filter(|m| m.local.is_some()).count(),
            remote_bytes: state.remote_bytes,
            key_blocks: state.key_blocks.len(),
        }
    }

    /// Diagnostic dump
    #[must_use]
    pub fn describe(&self) -> String {
        let stats = self.stats();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "db: keys={} remote={} local={} bytes={} blocks={}",
            stats.keys, stats.remote_values, stats.local_values, stats.remote_bytes, stats.key_blocks
        );
        let state = self.lock();
        for (key, mapping) in &state.mappings {
            let _ = writeln!(
                out,
                "  {} local={} remote={} sources={}{}",
                key,
                mapping.local.is_some(),
                mapping.remote.len(),
                mapping.sources.entry_count(),
                if self.adapter.is_diversified(key) { " diversified" } else { "" }
            );
        }
        out
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn live_block(state: &mut DbState, key: &NodeId, now_secs: u64) -> Option<KeyBlock> {
    let block = state.key_blocks.get(key)?;
    if block.is_expired(now_secs) {
        state.key_blocks.remove(key);
        return None;
    }
    Some(block.clone())
}

/// Apply one remote value: newer versions replace, deletions remove,
/// older versions are ignored
fn apply_remote(mapping: &mut Mapping, mut value: StoredValue, now: Instant) {
    value.local = false;
    let originator = value.originator.id;
    match mapping.remote.get_mut(&originator) {
        Some(entry) if value.version < entry.value.version => {}
        Some(_) if value.is_deletion() => {
            mapping.remote.remove(&originator);
        }
        Some(entry) => {
            entry.value = value;
            entry.refreshed = now;
        }
        None if value.is_deletion() => {}
        None => {
            mapping.remote.insert(
                originator,
                Entry {
                    value,
                    refreshed: now,
                },
            );
        }
    }
}

/// Per-source key: IP and port
fn source_key(addr: &SocketAddr) -> Vec<u8> {
    let mut key = crate::bloom::address_key(addr);
    key.extend_from_slice(&addr.port().to_be_bytes());
    key
}
