//! K-buckets
//!
//! A bucket covers every id whose first `depth` bits equal those of its
//! `prefix`. Splitting replaces a bucket by its two halves, so the set of
//! buckets always partitions the key space.

use crate::contact::Contact;
use crate::node_id::NodeId;
use std::collections::VecDeque;
use std::time::Instant;

/// Routing-table entry with liveness tracking
#[derive(Debug, Clone)]
pub struct RoutedContact {
    /// The contact
    pub contact: Contact,
    /// Consecutive failures since last heard from
    pub fails: u32,
    /// Whether the contact has ever answered us directly
    pub alive: bool,
    /// When the contact was first heard from directly
    pub first_alive: Option<Instant>,
    /// When the contact was last heard from or learned about
    pub last_seen: Instant,
}

impl RoutedContact {
    pub(crate) fn new(contact: Contact, alive: bool, now: Instant) -> Self {
        Self {
            contact,
            fails: 0,
            alive,
            first_alive: alive.then_some(now),
            last_seen: now,
        }
    }

    /// Whether the failure count has reached the applicable threshold
    #[must_use]
    pub fn is_failed(&self, max_fails_live: u32, max_fails_unknown: u32) -> bool {
        let limit = if self.alive {
            max_fails_live
        } else {
            max_fails_unknown
        };
        self.fails >= limit
    }

    pub(crate) fn mark_alive(&mut self, now: Instant) {
        self.fails = 0;
        self.alive = true;
        self.first_alive.get_or_insert(now);
        self.last_seen = now;
    }
}

/// One k-bucket with its replacement cache
#[derive(Debug, Clone)]
pub struct Bucket {
    pub(crate) prefix: NodeId,
    pub(crate) depth: usize,
    pub(crate) contacts: Vec<RoutedContact>,
    /// Most recent first
    pub(crate) replacements: VecDeque<RoutedContact>,
    pub(crate) last_touched: Instant,
}

impl Bucket {
    pub(crate) fn root(now: Instant) -> Self {
        Self {
            prefix: NodeId::ZERO,
            depth: 0,
            contacts: Vec::new(),
            replacements: VecDeque::new(),
            last_touched: now,
        }
    }

    /// Prefix bits shared by every id in the bucket
    #[must_use]
    pub fn prefix(&self) -> &NodeId {
        &self.prefix
    }

    /// Number of significant prefix bits
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Admitted contacts
    #[must_use]
    pub fn contacts(&self) -> &[RoutedContact] {
        &self.contacts
    }

    /// Replacement cache, most recent first
    pub fn replacements(&self) -> impl Iterator<Item = &RoutedContact> {
        self.replacements.iter()
    }

    /// Whether `id` falls inside this bucket's range
    #[must_use]
    pub fn covers(&self, id: &NodeId) -> bool {
        self.depth == 0 || id.common_prefix_len(&self.prefix) >= self.depth
    }

    pub(crate) fn position(&self, id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| c.contact.id == *id)
    }

    pub(crate) fn replacement_position(&self, id: &NodeId) -> Option<usize> {
        self.replacements.iter().position(|c| c.contact.id == *id)
    }

    /// Split into the halves with next bit 0 and 1
    pub(crate) fn split(self) -> (Bucket, Bucket) {
        let depth = self.depth + 1;
        let mut left = Bucket {
            prefix: self.prefix.with_bit(self.depth, false),
            depth,
            contacts: Vec::new(),
            replacements: VecDeque::new(),
            last_touched: self.last_touched,
        };
        let mut right = Bucket {
            prefix: self.prefix.with_bit(self.depth, true),
            ..left.clone()
        };

        for entry in self.contacts {
            if entry.contact.id.bit(self.depth) {
                right.contacts.push(entry);
            } else {
                left.contacts.push(entry);
            }
        }
        for entry in self.replacements {
            if entry.contact.id.bit(self.depth) {
                right.replacements.push_back(entry);
            } else {
                left.replacements.push_back(entry);
            }
        }
        (left, right)
    }

    /// Add to the replacement cache, dropping the oldest beyond `limit`
    pub(crate) fn add_replacement(&mut self, entry: RoutedContact, limit: usize) {
        if let Some(pos) = self.replacement_position(&entry.contact.id) {
            self.replacements.remove(pos);
        }
        self.replacements.push_front(entry);
        self.replacements.truncate(limit);
    }

    /// Random id inside this bucket's range
    #[must_use]
    pub fn random_id(&self) -> NodeId {
        NodeId::random_in_prefix(&self.prefix, self.depth)
    }
}
