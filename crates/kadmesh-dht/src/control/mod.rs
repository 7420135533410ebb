//! DHT control
//!
//! The Kademlia algorithm proper. [`DhtControl`] owns the routing table and
//! the value database, drives lookups over a [`DhtTransport`], replicates
//! values to the closest nodes and serves inbound requests as the
//! transport's [`RequestHandler`](crate::rpc::RequestHandler).
//!
//! Locks are coarse and never held across an await: the routing table and
//! the database each sit behind one mutex, and no code path holds one while
//! taking the other.

pub mod handler;
pub mod lookup;
pub mod republish;
pub mod state;

use crate::bloom::{BloomRotator, FilterKind};
use crate::config::DhtConfig;
use crate::contact::Contact;
use crate::db::diversify::{Diversification, DiversificationType, StorageAdapter};
use crate::db::key_block::KeyBlock;
use crate::db::value::{MAX_VALUE_SIZE, ReplicationControl, StoredValue};
use crate::db::{Database, DbLookup, DbStats};
use crate::error::{DhtError, Result};
use crate::node_id::NodeId;
use crate::routing::{RoutingConfig, RoutingTable};
use crate::rpc::messages::StoreOutcome;
use crate::rpc::{
    DhtTransport, DhtTransportExt, Priority, RequestHandler, RpcOptions, RpcResult, RpcStats,
};
use handler::SpoofTokens;
use lookup::{LookupKind, LookupOutcome};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

/// (contact, value) pairs remembered to suppress repeated caching
const CACHE_MEMORY: u32 = 4096;

/// Outcome of a put or remove
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    /// Logical key
    pub key: NodeId,
    /// Acknowledgements received
    pub acks: usize,
    /// Acknowledgements required by the replication control
    pub required: usize,
    /// Contacts that accepted the value
    pub stored_at: Vec<Contact>,
    /// Set when the key is diversified; the value was written to
    /// `put_keys` instead of, or in addition to, the key itself
    pub diversification: Option<Diversification>,
}

impl PutResult {
    /// Whether the key is diversified
    #[must_use]
    pub fn is_diversified(&self) -> bool {
        self.diversification.is_some()
    }
}

/// Outcome of a get
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    /// Logical key
    pub key: NodeId,
    /// Values, newest first
    pub values: Vec<StoredValue>,
    /// Diversification of the key, if any
    pub diversification: Option<Diversification>,
}

/// Control-level counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlStats {
    /// Routing table size
    pub contacts: usize,
    /// Contacts that answered and have no failures
    pub live_contacts: usize,
    /// Database counters
    pub db: DbStats,
    /// Transport counters
    pub rpc: RpcStats,
    /// Time since start
    pub uptime: Duration,
    /// Transport's reachability estimate
    pub reachable: bool,
}

#[derive(Debug, Default)]
struct KeyStore {
    acks: usize,
    stored_at: Vec<Contact>,
    diversified: Option<Diversification>,
    blocked: Option<KeyBlock>,
}

/// The Kademlia core of one DHT instance
pub struct DhtControl {
    config: DhtConfig,
    local_id: NodeId,
    transport: Arc<dyn DhtTransport>,
    router: Mutex<RoutingTable>,
    db: Database,
    spoof: SpoofTokens,
    lookups: Semaphore,
    started: Instant,
    published: Mutex<HashMap<NodeId, Instant>>,
    recently_cached: Mutex<BloomRotator>,
    sleeping: AtomicBool,
    suspended: AtomicBool,
}

impl DhtControl {
    /// Create the control layer and install it as `transport`'s request
    /// handler
    ///
    /// # Errors
    ///
    /// Returns `DhtError::InvalidConfig` if `config` does not validate
    pub fn new(
        config: DhtConfig,
        transport: Arc<dyn DhtTransport>,
        adapter: Arc<dyn StorageAdapter>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let local_id = transport.local_contact().id;
        let router = RoutingTable::new(local_id, RoutingConfig::from(&config));
        let db = Database::new(&config, adapter)?;
        let recently_cached = BloomRotator::new(FilterKind::AddOnly, CACHE_MEMORY, 4)
            .map_err(|e| DhtError::InvalidConfig(e.to_string().into()))?;
        let control = Arc::new(Self {
            lookups: Semaphore::new(config.max_concurrent_lookups),
            config,
            local_id,
            transport: transport.clone(),
            router: Mutex::new(router),
            db,
            spoof: SpoofTokens::new(),
            started: Instant::now(),
            published: Mutex::new(HashMap::new()),
            recently_cached: Mutex::new(recently_cached),
            sleeping: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
        });
        let handler: Arc<dyn RequestHandler> = control.clone();
        transport.set_request_handler(Arc::downgrade(&handler));
        tracing::debug!("DHT control started for {}", local_id);
        Ok(control)
    }

    pub(crate) fn router(&self) -> MutexGuard<'_, RoutingTable> {
        self.router.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn options(&self, priority: Priority) -> RpcOptions {
        RpcOptions::new(self.config.rpc_timeout()).with_priority(priority)
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Local node id
    #[must_use]
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Local contact as advertised
    #[must_use]
    pub fn local_contact(&self) -> Contact {
        self.transport.local_contact()
    }

    /// Transport in use
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn DhtTransport> {
        &self.transport
    }

    /// Value database
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Every contact in the routing table
    #[must_use]
    pub fn contacts(&self) -> Vec<Contact> {
        self.router().all_contacts()
    }

    /// Contacts that answered and have no failures
    #[must_use]
    pub fn live_contacts(&self) -> Vec<Contact> {
        self.router().live_contacts()
    }

    /// Up to `count` known contacts closest to `target`
    #[must_use]
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        self.router().find_closest(target, count)
    }

    /// Record a contact learned out of band
    pub fn add_contact(&self, contact: Contact, alive: bool) {
        self.router().contact_seen(contact, alive);
    }

    /// Join the network through `seeds`.
    ///
    /// Each seed is asked for the contacts closest to the local id, then a
    /// lookup for the local id fills the table. Returns the routing table
    /// size afterwards.
    pub async fn bootstrap(self: &Arc<Self>, seeds: &[SocketAddr]) -> usize {
        let options = self.options(Priority::High);
        let mut queries = JoinSet::new();
        for &seed in seeds {
            let control = Arc::clone(self);
            queries.spawn(async move {
                let placeholder = Contact::placeholder(seed);
                let result = control
                    .transport
                    .find_node(&placeholder, control.local_id, options)
                    .await;
                (seed, result)
            });
        }
        while let Some(joined) = queries.join_next().await {
            let Ok((seed, result)) = joined else {
                continue;
            };
            match result {
                Ok((mut sender, contacts, spoof_token)) => {
                    sender.spoof_token = Some(spoof_token);
                    tracing::debug!("Seed {} returned {} contacts", seed, contacts.len());
                    self.reply_received(&sender, &contacts);
                }
                Err(e) => tracing::warn!("Seed {} failed: {}", seed, e),
            }
        }

        self.iterate(self.local_id, LookupKind::Node, false).await;
        let size = self.router().len();
        tracing::info!("Bootstrap complete: {} contacts", size);
        size
    }

    /// Closest live contacts to `target` found by a FIND_NODE walk
    pub async fn lookup_nodes(self: &Arc<Self>, target: NodeId, exhaustive: bool) -> Vec<Contact> {
        self.iterate(target, LookupKind::Node, exhaustive).await.closest
    }

    /// PING `contact`
    ///
    /// # Errors
    ///
    /// Returns `DhtError::Rpc` if the contact does not answer
    pub async fn ping(&self, contact: &Contact, priority: Priority) -> Result<Contact> {
        match self.transport.ping(contact, self.options(priority)).await {
            Ok(sender) => {
                self.reply_received(&sender, &[]);
                Ok(sender)
            }
            Err(e) => {
                self.request_failed(contact, &e);
                Err(e.into())
            }
        }
    }

    /// Store a value under `key` and replicate it to the closest nodes.
    ///
    /// Completes once the replication control's quorum acknowledged the
    /// value; the remaining STOREs finish in the background.
    ///
    /// # Errors
    ///
    /// - `DhtError::ValueTooLarge` if `payload` exceeds [`MAX_VALUE_SIZE`]
    /// - `DhtError::KeyBlocked` if a key-block covers `key`
    /// - `DhtError::QuorumNotReached` if too few nodes accepted the value
    pub async fn put(
        self: &Arc<Self>,
        key: NodeId,
        payload: Vec<u8>,
        flags: u8,
        life_hours: u8,
        replication_control: ReplicationControl,
        priority: Priority,
    ) -> Result<PutResult> {
        if payload.len() > MAX_VALUE_SIZE {
            return Err(DhtError::ValueTooLarge {
                size: payload.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        if self.db.key_block(&key).is_some() {
            return Err(DhtError::KeyBlocked { key });
        }
        let value = self.db.store_local(
            key,
            payload,
            flags,
            life_hours,
            replication_control,
            &self.local_contact(),
        );
        self.mark_published(key);
        self.replicate(value, priority).await
    }

    /// Look up values under `key`.
    ///
    /// Diversified keys are resolved across all their sub-keys. After a
    /// successful lookup the values are cached at the closest nodes that
    /// did not hold them.
    ///
    /// # Errors
    ///
    /// Returns `DhtError::KeyBlocked` if a key-block covers `key`
    pub async fn get(
        self: &Arc<Self>,
        key: NodeId,
        max_values: u16,
        exhaustive: bool,
    ) -> Result<GetResult> {
        if self.db.key_block(&key).is_some() {
            return Err(DhtError::KeyBlocked { key });
        }

        let outcome = self
            .iterate(key, LookupKind::Value { max_values }, exhaustive)
            .await;
        if outcome.blocked.is_some() {
            return Err(DhtError::KeyBlocked { key });
        }

        let known = self.db.adapter().get_existing_diversification(&key);
        let diversification = match (known, &outcome.diversification) {
            (Some(known), _) => Some(known),
            (None, Some(reported)) if reported.kind != DiversificationType::None => Some(
                self.db
                    .adapter()
                    .create_new_diversification(&key, reported.kind),
            ),
            _ => None,
        };

        let mut values = outcome.values.clone();
        if let DbLookup::Values { values: local, .. } = self.db.get(&key, 0) {
            values.extend(local);
        }

        match &diversification {
            Some(div) => {
                let mut lookups = JoinSet::new();
                for sub_key in div.get_keys() {
                    let control = Arc::clone(self);
                    lookups.spawn(async move {
                        control
                            .iterate(sub_key, LookupKind::Value { max_values }, exhaustive)
                            .await
                    });
                }
                while let Some(joined) = lookups.join_next().await {
                    if let Ok(sub) = joined {
                        values.extend(sub.values);
                    }
                }
            }
            None if !outcome.values.is_empty() => self.cache_at_non_holders(&outcome),
            None => {}
        }

        let values = normalize_values(key, values, max_values);
        Ok(GetResult {
            key,
            values,
            diversification,
        })
    }

    /// Withdraw this node's value under `key` from the closest nodes
    ///
    /// # Errors
    ///
    /// - `DhtError::InvalidState` if this node holds no value under `key`
    /// - replication failures as for [`DhtControl::put`]
    pub async fn remove(self: &Arc<Self>, key: NodeId, priority: Priority) -> Result<PutResult> {
        let deletion = self
            .db
            .remove_local(&key)
            .ok_or(DhtError::InvalidState("no local value under key".into()))?;
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
        self.replicate(deletion, priority).await
    }

    /// Withdraw this node's value under `key` from explicit `contacts`
    ///
    /// # Errors
    ///
    /// - `DhtError::InvalidState` if this node holds no value under `key`
    /// - `DhtError::QuorumNotReached` if no contact accepted the deletion
    pub async fn remove_from(
        self: &Arc<Self>,
        key: NodeId,
        contacts: &[Contact],
        priority: Priority,
    ) -> Result<PutResult> {
        let deletion = self
            .db
            .remove_local(&key)
            .ok_or(DhtError::InvalidState("no local value under key".into()))?;
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
        let required = deletion.replication_control.quorum().min(contacts.len().max(1));
        let store = self
            .store_at_contacts(contacts.to_vec(), vec![deletion], priority, required, key)
            .await;
        self.finish_store(key, store, required, None)
    }

    /// Apply a key-block locally and send it to the nodes closest to its
    /// key; returns how many of them accepted it
    ///
    /// # Errors
    ///
    /// Returns `DhtError::KeyBlock` if the block does not verify against
    /// the configured authority
    pub async fn publish_key_block(self: &Arc<Self>, block: KeyBlock) -> Result<usize> {
        self.db.apply_key_block(block.clone())?;
        let closest = self.lookup_nodes(block.key, false).await;
        let options = self.options(Priority::High);

        let mut sends = JoinSet::new();
        for contact in closest {
            let control = Arc::clone(self);
            let block = block.clone();
            sends.spawn(async move { control.transport.key_block(&contact, block, options).await });
        }
        let mut accepted = 0;
        while let Some(joined) = sends.join_next().await {
            if let Ok(Ok(true)) = joined {
                accepted += 1;
            }
        }
        tracing::info!("Key-block for {} accepted by {} nodes", block.key, accepted);
        Ok(accepted)
    }

    async fn replicate(self: &Arc<Self>, value: StoredValue, priority: Priority) -> Result<PutResult> {
        let key = value.key;
        let required = value.replication_control.quorum();

        if let Some(div) = self.db.adapter().get_existing_diversification(&key) {
            return self.replicate_diversified(value, div, priority, required).await;
        }

        let store = self
            .store_at_key(key, vec![value.clone()], priority, required)
            .await;
        let Some(signal) = store.diversified.clone() else {
            return self.finish_store(key, store, required, None);
        };

        // Redirect to the diversified sub-keys; quorum is judged on the
        // nodes that accepted the value under the key itself
        let div = self.db.adapter().create_new_diversification(&key, signal.kind);
        tracing::debug!("Key {} diversified ({:?}), redirecting put", key, div.kind);
        let mut store = store;
        for put_key in div.put_keys.iter().copied().filter(|k| *k != key) {
            let mut redirected = value.clone();
            redirected.key = put_key;
            let sub = self
                .store_at_key(put_key, vec![redirected], priority, required)
                .await;
            store.stored_at.extend(sub.stored_at);
        }
        self.finish_store(key, store, required, Some(div))
    }

    async fn replicate_diversified(
        self: &Arc<Self>,
        value: StoredValue,
        div: Diversification,
        priority: Priority,
        required: usize,
    ) -> Result<PutResult> {
        let mut combined = KeyStore {
            acks: usize::MAX,
            ..KeyStore::default()
        };
        for put_key in &div.put_keys {
            let mut redirected = value.clone();
            redirected.key = *put_key;
            let sub = self
                .store_at_key(*put_key, vec![redirected], priority, required)
                .await;
            if sub.blocked.is_some() {
                return Err(DhtError::KeyBlocked { key: value.key });
            }
            combined.acks = combined.acks.min(sub.acks);
            combined.stored_at.extend(sub.stored_at);
        }
        if combined.acks == usize::MAX {
            combined.acks = 0;
        }
        self.finish_store(value.key, combined, required, Some(div))
    }

    fn finish_store(
        &self,
        key: NodeId,
        store: KeyStore,
        required: usize,
        diversification: Option<Diversification>,
    ) -> Result<PutResult> {
        if store.blocked.is_some() {
            return Err(DhtError::KeyBlocked { key });
        }
        if store.acks < required {
            return Err(DhtError::QuorumNotReached {
                acks: store.acks,
                required,
            });
        }
        Ok(PutResult {
            key,
            acks: store.acks,
            required,
            stored_at: store.stored_at,
            diversification,
        })
    }

    async fn store_at_key(
        self: &Arc<Self>,
        physical_key: NodeId,
        values: Vec<StoredValue>,
        priority: Priority,
        required: usize,
    ) -> KeyStore {
        let closest = self.lookup_nodes(physical_key, false).await;
        self.store_at_contacts(closest, values, priority, required, physical_key)
            .await
    }

    /// Send `values` to every contact in parallel and return once `required`
    /// accepted or all answered
    async fn store_at_contacts(
        self: &Arc<Self>,
        contacts: Vec<Contact>,
        values: Vec<StoredValue>,
        priority: Priority,
        required: usize,
        physical_key: NodeId,
    ) -> KeyStore {
        let options = self.options(priority);
        let (tx, mut rx) = mpsc::unbounded_channel();
        for contact in contacts {
            let control = Arc::clone(self);
            let values = values.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = control.store_to(&contact, values, options).await;
                let _ = tx.send((contact, outcome));
            });
        }
        drop(tx);

        let mut store = KeyStore::default();
        while let Some((contact, outcome)) = rx.recv().await {
            match outcome {
                Ok(StoreOutcome::Accepted { diversified }) => {
                    store.acks += 1;
                    store.stored_at.push(contact);
                    if store.diversified.is_none() {
                        store.diversified = diversified.into_iter().find(|d| d.key == physical_key);
                    }
                }
                Ok(StoreOutcome::Blocked(block)) => {
                    if self.accept_remote_block(&contact, physical_key, block.clone()) {
                        store.blocked = Some(block);
                        return store;
                    }
                }
                Ok(StoreOutcome::Refused) => {
                    tracing::debug!("{} refused store for {}", contact, physical_key);
                }
                Ok(StoreOutcome::SpoofRejected) => {
                    tracing::debug!("{} rejected our spoof token", contact);
                }
                Err(_) => {}
            }
            if store.acks >= required {
                break;
            }
        }
        store
    }

    /// STORE at one contact, fetching an anti-spoof token first if needed
    pub(crate) async fn store_to(
        &self,
        contact: &Contact,
        values: Vec<StoredValue>,
        options: RpcOptions,
    ) -> RpcResult<StoreOutcome> {
        let known = contact
            .spoof_token
            .or_else(|| self.router().contact(&contact.id).and_then(|e| e.contact.spoof_token));
        let token = match known {
            Some(token) => token,
            None => self.fetch_spoof_token(contact, options).await?,
        };

        let outcome = self.store_once(contact, token, values.clone(), options).await?;
        if outcome != StoreOutcome::SpoofRejected {
            return Ok(outcome);
        }
        // The node may have restarted; one retry with a fresh token
        let token = self.fetch_spoof_token(contact, options).await?;
        self.store_once(contact, token, values, options).await
    }

    async fn store_once(
        &self,
        contact: &Contact,
        token: u32,
        values: Vec<StoredValue>,
        options: RpcOptions,
    ) -> RpcResult<StoreOutcome> {
        match self.transport.store(contact, token, values, options).await {
            Ok((sender, outcome)) => {
                self.reply_received(&sender, &[]);
                Ok(outcome)
            }
            Err(e) => {
                self.request_failed(contact, &e);
                Err(e)
            }
        }
    }

    async fn fetch_spoof_token(&self, contact: &Contact, options: RpcOptions) -> RpcResult<u32> {
        match self.transport.find_node(contact, contact.id, options).await {
            Ok((mut sender, contacts, token)) => {
                sender.spoof_token = Some(token);
                self.reply_received(&sender, &contacts);
                Ok(token)
            }
            Err(e) => {
                self.request_failed(contact, &e);
                Err(e)
            }
        }
    }

    /// Copy values found by a lookup to the closest responders that did
    /// not return them
    fn cache_at_non_holders(self: &Arc<Self>, outcome: &LookupOutcome) {
        let holders: HashSet<NodeId> = outcome.holders.iter().map(|c| c.id).collect();
        let targets: Vec<Contact> = outcome
            .closest
            .iter()
            .filter(|c| !holders.contains(&c.id))
            .take(self.config.cache_at_closest_n)
            .cloned()
            .collect();
        if targets.is_empty() {
            return;
        }
        let values: Vec<StoredValue> = outcome.values.iter().filter(|v| !v.local).cloned().collect();
        let options = self.options(Priority::Low);
        for contact in targets {
            // Hot keys are read repeatedly; skip (contact, value) pairs
            // cached recently
            let values: Vec<StoredValue> = {
                let mut cached = self
                    .recently_cached
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                values
                    .iter()
                    .filter(|v| cached.add(&cache_memory_key(&contact.id, v)) == 0)
                    .cloned()
                    .collect()
            };
            if values.is_empty() {
                continue;
            }
            let control = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = control.store_to(&contact, values, options).await {
                    tracing::trace!("Caching at {} failed: {}", contact, e);
                }
            });
        }
    }

    pub(crate) fn mark_published(&self, key: NodeId) {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Instant::now());
    }

    /// Enter or leave sleeping mode
    pub fn set_sleeping(&self, sleeping: bool) {
        self.sleeping.store(sleeping, Ordering::Release);
        self.router().set_sleeping(sleeping);
        self.db.set_sleeping(sleeping);
        self.transport.set_sleeping(sleeping);
    }

    /// Whether sleeping
    #[must_use]
    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::Acquire)
    }

    /// Enter or leave suspended mode.
    ///
    /// Suspended nodes leave inbound requests unanswered, refuse stores and
    /// skip maintenance. Resuming republishes every value this node
    /// originated in the background, since holders may have dropped them.
    pub fn set_suspended(self: &Arc<Self>, suspended: bool) {
        if self.suspended.swap(suspended, Ordering::AcqRel) == suspended {
            return;
        }
        self.db.set_suspended(suspended);
        self.transport.set_suspended(suspended);
        if suspended {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let control = Arc::clone(self);
                runtime.spawn(async move {
                    control.republish_all_originals().await;
                });
            }
            Err(_) => tracing::debug!("Resumed outside a runtime; originals wait for the republish timer"),
        }
    }

    /// Whether suspended
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Stop lookups and close the transport
    pub async fn shutdown(&self) {
        self.lookups.close();
        self.transport.close().await;
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> ControlStats {
        let (contacts, live_contacts) = {
            let router = self.router();
            (router.len(), router.live_contacts().len())
        };
        ControlStats {
            contacts,
            live_contacts,
            db: self.db.stats(),
            rpc: self.transport.stats(),
            uptime: self.started.elapsed(),
            reachable: self.transport.is_reachable(),
        }
    }

    /// Multi-line diagnostic report
    #[must_use]
    pub fn describe(&self) -> String {
        let stats = self.stats();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "dht: {} uptime={}s reachable={} sleeping={} suspended={}",
            self.local_contact(),
            stats.uptime.as_secs(),
            stats.reachable,
            self.is_sleeping(),
            self.is_suspended()
        );
        let total = stats.rpc.total();
        let _ = writeln!(
            out,
            "rpc: sent={} ok={} failed={} received={} alien={}",
            total.sent, total.succeeded, total.failed, total.received, total.alien
        );
        out.push_str(&self.router().describe());
        out.push_str(&self.db.describe());
        out
    }
}

impl std::fmt::Debug for DhtControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhtControl")
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}

/// Caching memory entry for `value` sent to `contact`
fn cache_memory_key(contact: &NodeId, value: &StoredValue) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(contact.as_bytes());
    key.extend_from_slice(&value.fingerprint().to_be_bytes());
    key
}

/// Re-key values to `key`, keep the newest version per originator, newest
/// first, limited to `max_values` (0 means all)
fn normalize_values(key: NodeId, values: Vec<StoredValue>, max_values: u16) -> Vec<StoredValue> {
    let mut newest: HashMap<NodeId, StoredValue> = HashMap::new();
    for mut value in values {
        if value.is_deletion() {
            continue;
        }
        value.key = key;
        match newest.get(&value.originator.id) {
            Some(existing) if existing.version >= value.version => {}
            _ => {
                newest.insert(value.originator.id, value);
            }
        }
    }
    let mut values: Vec<StoredValue> = newest.into_values().collect();
    values.sort_by(|a, b| b.created_ms.cmp(&a.created_ms));
    if max_values > 0 {
        values.truncate(usize::from(max_values));
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(key: NodeId, origin: u8, version: u32, created_ms: u64) -> StoredValue {
        let addr = format!("10.0.0.{origin}:1").parse().unwrap();
        StoredValue {
            key,
            payload: vec![origin],
            flags: 0,
            life_hours: 0,
            replication_control: ReplicationControl::DEFAULT,
            originator: Contact::placeholder(addr),
            created_ms,
            version,
            local: false,
            diversification: DiversificationType::None,
        }
    }

    #[test]
    fn test_normalize_values() {
        let key = NodeId::hash(b"logical");
        let sub = key.sub_key(3);
        let values = vec![
            value(sub, 1, 1, 10),
            value(key, 1, 2, 20),
            value(key, 2, 1, 30),
        ];
        let normalized = normalize_values(key, values, 0);
        assert_eq!(normalized.len(), 2);
        assert!(normalized.iter().all(|v| v.key == key));
        assert_eq!(normalized[0].created_ms, 30);
        assert_eq!(normalized[1].version, 2);

        assert_eq!(normalize_values(key, normalized, 1).len(), 1);
    }

    #[test]
    fn test_cache_memory_tracks_value_versions() {
        let holder = NodeId::hash(b"holder");
        let first = value(NodeId::hash(b"hot"), 1, 1, 10);
        let mut memory = BloomRotator::new(FilterKind::AddOnly, CACHE_MEMORY, 4).unwrap();
        assert_eq!(memory.add(&cache_memory_key(&holder, &first)), 0);
        assert!(memory.add(&cache_memory_key(&holder, &first)) > 0);

        let mut newer = first.clone();
        newer.version = 2;
        assert_eq!(memory.add(&cache_memory_key(&holder, &newer)), 0);
        assert_eq!(memory.add(&cache_memory_key(&NodeId::hash(b"other"), &first)), 0);
    }
}
