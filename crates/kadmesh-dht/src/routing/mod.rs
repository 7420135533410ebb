//! Kademlia routing table
//!
//! Buckets are kept in a flat vector ordered by prefix. The root bucket
//! covers the whole key space; a full bucket splits into its two halves when
//! it holds the local id, when its depth is not a multiple of `b`, or when it
//! lies inside the smallest subtree holding the `k` closest contacts to the
//! local id. Otherwise a newcomer waits in the bucket's replacement cache
//! until a member fails past its threshold.

mod bucket;

pub use bucket::{Bucket, RoutedContact};

use crate::config::DhtConfig;
use crate::contact::Contact;
use crate::node_id::NodeId;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

/// Routing parameters, usually derived from [`DhtConfig`]
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Bucket capacity
    pub k: usize,
    /// Split depth granularity
    pub b: usize,
    /// Replacement cache size while awake
    pub max_replacements: usize,
    /// Failure threshold for contacts that answered before
    pub max_fails_live: u32,
    /// Failure threshold for never-answered contacts
    pub max_fails_unknown: u32,
    /// Untouched buckets are refreshed after this long
    pub refresh_interval: Duration,
    /// Silence after which a contact becomes a ping candidate
    pub ping_stale_after: Duration,
}

impl From<&DhtConfig> for RoutingConfig {
    fn from(config: &DhtConfig) -> Self {
        Self {
            k: config.k,
            b: config.b,
            max_replacements: config.max_replacements,
            max_fails_live: config.max_fails_live,
            max_fails_unknown: config.max_fails_unknown,
            refresh_interval: config.bucket_refresh_interval(),
            ping_stale_after: config.ping_stale_after(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self::from(&DhtConfig::default())
    }
}

/// Result of [`RoutingTable::contact_seen`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeenOutcome {
    /// Admitted into a bucket
    Added,
    /// Already known; liveness refreshed
    Updated,
    /// Known id with a new instance id; contact replaced and counters reset
    Restarted,
    /// Bucket full and not splittable; kept in the replacement cache
    Cached,
    /// Local id or unsupported protocol version
    Ignored,
}

/// Result of [`RoutingTable::contact_failed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Not a bucket member
    Unknown,
    /// Failure counted, still below threshold
    Counted(u32),
    /// Threshold reached; evicted and possibly replaced
    Evicted {
        /// Replacement promoted into the freed slot
        promoted: Option<Contact>,
    },
}

/// The routing table
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    config: RoutingConfig,
    buckets: Vec<Bucket>,
    sleeping: bool,
    imported: HashSet<NodeId>,
}

impl RoutingTable {
    /// Create an empty table around `local_id`
    #[must_use]
    pub fn new(local_id: NodeId, config: RoutingConfig) -> Self {
        Self {
            local_id,
            config,
            buckets: vec![Bucket::root(Instant::now())],
            sleeping: false,
            imported: HashSet::new(),
        }
    }

    /// Local node id
    #[must_use]
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Routing parameters
    #[must_use]
    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// All buckets, ordered by prefix
    #[must_use]
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Number of admitted contacts
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    /// Whether no contact is admitted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.contacts.is_empty())
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        // The buckets partition the key space, so exactly one covers `id`
        self.buckets
            .iter()
            .position(|b| b.covers(id))
            .unwrap_or_default()
    }

    fn replacement_limit(&self) -> usize {
        if self.sleeping {
            self.config.max_replacements.min(1)
        } else {
            self.config.max_replacements
        }
    }

    /// Record that `contact` is known to exist.
    ///
    /// `alive` is true when the contact talked to us directly and false when
    /// we only learned about it from a third party.
    pub fn contact_seen(&mut self, contact: Contact, alive: bool) -> SeenOutcome {
        if contact.id == self.local_id || !contact.is_supported() {
            return SeenOutcome::Ignored;
        }
        let now = Instant::now();
        let idx = self.bucket_index(&contact.id);

        {
            let bucket = &mut self.buckets[idx];
            if let Some(pos) = bucket.position(&contact.id) {
                if alive {
                    bucket.last_touched = now;
                }
                let entry = &mut bucket.contacts[pos];
                return refresh_entry(entry, contact, alive, now);
            }

            if let Some(pos) = bucket.replacement_position(&contact.id) {
                if let Some(mut entry) = bucket.replacements.remove(pos) {
                    refresh_entry(&mut entry, contact, alive, now);
                    if bucket.contacts.len() < self.config.k {
                        bucket.contacts.push(entry);
                        return SeenOutcome::Added;
                    }
                    bucket.replacements.push_front(entry);
                }
                return SeenOutcome::Cached;
            }
        }

        let mut idx = idx;
        loop {
            if self.buckets[idx].contacts.len() < self.config.k {
                let bucket = &mut self.buckets[idx];
                if alive {
                    bucket.last_touched = now;
                }
                tracing::trace!("Routing: added {}", contact);
                bucket.contacts.push(RoutedContact::new(contact, alive, now));
                return SeenOutcome::Added;
            }

            if !self.should_split(idx) {
                let limit = self.replacement_limit();
                self.buckets[idx].add_replacement(RoutedContact::new(contact, alive, now), limit);
                return SeenOutcome::Cached;
            }

            let full = self.buckets.remove(idx);
            tracing::trace!(
                "Routing: splitting bucket at depth {} ({} contacts)",
                full.depth,
                full.contacts.len()
            );
            let (left, right) = full.split();
            self.buckets.insert(idx, right);
            self.buckets.insert(idx, left);
            idx = self.bucket_index(&contact.id);
        }
    }

    fn should_split(&self, idx: usize) -> bool {
        let bucket = &self.buckets[idx];
        if bucket.depth >= NodeId::BITS {
            return false;
        }
        if bucket.covers(&self.local_id) || bucket.depth % self.config.b != 0 {
            return true;
        }
        let shared = bucket
            .prefix
            .common_prefix_len(&self.local_id)
            .min(bucket.depth);
        shared >= self.closest_subtree_depth()
    }

    /// Depth of the smallest subtree around the local id that holds the `k`
    /// closest contacts; 0 while fewer than `k` are known
    fn closest_subtree_depth(&self) -> usize {
        let closest = self.find_closest(&self.local_id, self.config.k);
        if closest.len() < self.config.k {
            return 0;
        }
        closest
            .last()
            .map_or(0, |c| c.id.common_prefix_len(&self.local_id))
    }

    /// Record a failed RPC to `id`.
    ///
    /// Once the contact reaches its failure threshold it is removed and the
    /// most recent replacement takes its place.
    pub fn contact_failed(&mut self, id: &NodeId) -> FailOutcome {
        let idx = self.bucket_index(id);
        let (max_live, max_unknown) = (self.config.max_fails_live, self.config.max_fails_unknown);
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.replacement_position(id) {
            bucket.replacements.remove(pos);
            return FailOutcome::Unknown;
        }
        let Some(pos) = bucket.position(id) else {
            return FailOutcome::Unknown;
        };

        let entry = &mut bucket.contacts[pos];
        entry.fails += 1;
        if !entry.is_failed(max_live, max_unknown) {
            return FailOutcome::Counted(entry.fails);
        }

        let evicted = bucket.contacts.swap_remove(pos);
        tracing::debug!("Routing: evicted {} after {} failures", evicted.contact, evicted.fails);

        let next = bucket
            .replacements
            .iter()
            .position(|r| r.alive)
            .or(if bucket.replacements.is_empty() { None } else { Some(0) });
        let promoted = next
            .and_then(|pos| bucket.replacements.remove(pos))
            .map(|entry| {
                let contact = entry.contact.clone();
                bucket.contacts.push(entry);
                contact
            });
        FailOutcome::Evicted { promoted }
    }

    /// Remove a contact outright
    pub fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        let idx = self.bucket_index(id);
        let bucket = &mut self.buckets[idx];
        let pos = bucket.position(id)?;
        Some(bucket.contacts.swap_remove(pos).contact)
    }

    /// Up to `count` contacts sorted by XOR distance to `target`
    #[must_use]
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut all: Vec<&RoutedContact> = self.entries().collect();
        all.sort_by(|a, b| {
            a.contact
                .id
                .distance(target)
                .cmp(&b.contact.id.distance(target))
                .then_with(|| a.contact.id.cmp(&b.contact.id))
        });
        all.into_iter()
            .take(count)
            .map(|e| e.contact.clone())
            .collect()
    }

    /// Admitted contact with `id`
    #[must_use]
    pub fn contact(&self, id: &NodeId) -> Option<&RoutedContact> {
        let bucket = &self.buckets[self.bucket_index(id)];
        bucket.position(id).map(|pos| &bucket.contacts[pos])
    }

    /// Every admitted entry
    pub fn entries(&self) -> impl Iterator<Item = &RoutedContact> {
        self.buckets.iter().flat_map(|b| b.contacts.iter())
    }

    /// Every admitted contact
    #[must_use]
    pub fn all_contacts(&self) -> Vec<Contact> {
        self.entries().map(|e| e.contact.clone()).collect()
    }

    /// Contacts that have answered us and are below any failure
    #[must_use]
    pub fn live_contacts(&self) -> Vec<Contact> {
        self.entries()
            .filter(|e| e.alive && e.fails == 0)
            .map(|e| e.contact.clone())
            .collect()
    }

    /// The contact most in need of a liveness probe.
    ///
    /// Picks the entry with the most failures; among equals, the one silent
    /// the longest. Entries heard from within the stale interval and without
    /// failures are not candidates.
    #[must_use]
    pub fn contact_to_ping(&self, now: Instant) -> Option<Contact> {
        self.entries()
            .filter(|e| {
                e.fails > 0
                    || !e.alive
                    || now.saturating_duration_since(e.last_seen) >= self.config.ping_stale_after
            })
            .max_by_key(|e| (e.fails, now.saturating_duration_since(e.last_seen)))
            .map(|e| e.contact.clone())
    }

    /// Random targets inside each bucket not touched for the refresh
    /// interval. The buckets are marked touched.
    pub fn refresh_targets(&mut self, now: Instant) -> Vec<NodeId> {
        let interval = self.config.refresh_interval;
        self.buckets
            .iter_mut()
            .filter(|b| now.saturating_duration_since(b.last_touched) >= interval)
            .map(|b| {
                b.last_touched = now;
                b.random_id()
            })
            .collect()
    }

    /// Mark the bucket covering `target` as recently looked up
    pub fn touch(&mut self, target: &NodeId) {
        let idx = self.bucket_index(target);
        self.buckets[idx].last_touched = Instant::now();
    }

    /// Enter or leave sleeping mode; sleeping shrinks replacement caches
    pub fn set_sleeping(&mut self, sleeping: bool) {
        self.sleeping = sleeping;
        let limit = self.replacement_limit();
        for bucket in &mut self.buckets {
            bucket.replacements.truncate(limit);
        }
    }

    /// Whether the table is in sleeping mode
    #[must_use]
    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    /// Remember that `id` came from an imported state snapshot
    pub fn mark_imported(&mut self, id: NodeId) {
        self.imported.insert(id);
    }

    /// Whether `id` came from an imported state snapshot
    #[must_use]
    pub fn was_imported(&self, id: &NodeId) -> bool {
        self.imported.contains(id)
    }

    /// Multi-line diagnostic dump
    #[must_use]
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "routing: local={} buckets={} contacts={}",
            self.local_id,
            self.buckets.len(),
            self.len()
        );
        for bucket in &self.buckets {
            if bucket.contacts.is_empty() && bucket.replacements.is_empty() {
                continue;
            }
            let _ = writeln!(
                out,
                "  [{}/{}] contacts={} replacements={}",
                bucket.prefix,
                bucket.depth,
                bucket.contacts.len(),
                bucket.replacements.len()
            );
            for entry in &bucket.contacts {
                let _ = writeln!(
                    out,
                    "    {} alive={} fails={}",
                    entry.contact, entry.alive, entry.fails
                );
            }
        }
        out
    }
}

fn refresh_entry(entry: &mut RoutedContact, contact: Contact, alive: bool, now: Instant) -> SeenOutcome {
    if contact.instance_id != entry.contact.instance_id && alive {
        tracing::debug!("Routing: {} restarted", contact);
        entry.contact = contact;
        entry.fails = 0;
        entry.alive = true;
        entry.first_alive = Some(now);
        entry.last_seen = now;
        return SeenOutcome::Restarted;
    }

    if alive {
        let token = contact.spoof_token.or(entry.contact.spoof_token);
        entry.contact = Contact {
            spoof_token: token,
            ..contact
        };
        entry.mark_alive(now);
    }
    SeenOutcome::Updated
}
