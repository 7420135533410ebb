//! Iterative lookup
//!
//! [`LookupState`] is the bookkeeping of one FIND_NODE or FIND_VALUE walk:
//! candidates sorted by distance to the target, which of them are in
//! flight, which answered and which failed. The driver in
//! [`DhtControl::iterate`] keeps up to `alpha` requests outstanding against
//! the closest unqueried candidates until the state reports completion.
//!
//! A walk ends its exploration after a full round of replies brings no
//! contact closer than the best already known. It then queries whatever is
//! still unqueried among the `k` closest and stops. An exhaustive walk
//! never stops exploring early.

use super::DhtControl;
use crate::contact::Contact;
use crate::db::diversify::Diversification;
use crate::db::key_block::KeyBlock;
use crate::db::value::StoredValue;
use crate::node_id::NodeId;
use crate::rpc::messages::FindValueReply;
use crate::rpc::{DhtTransportExt, RpcError, RpcOptions};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Unqueried,
    InFlight,
    Responded,
    Failed,
}

#[derive(Debug, Clone)]
struct Candidate {
    contact: Contact,
    distance: NodeId,
    progress: Progress,
}

/// Bookkeeping of one lookup
#[derive(Debug)]
pub struct LookupState {
    target: NodeId,
    local_id: NodeId,
    k: usize,
    alpha: usize,
    exhaustive: bool,
    candidates: Vec<Candidate>,
    best: Option<NodeId>,
    stale_replies: usize,
    sweeping: bool,
}

impl LookupState {
    /// Start a lookup for `target` from `seeds`
    #[must_use]
    pub fn new(
        target: NodeId,
        local_id: NodeId,
        seeds: Vec<Contact>,
        k: usize,
        alpha: usize,
        exhaustive: bool,
    ) -> Self {
        let mut state = Self {
            target,
            local_id,
            k: k.max(1),
            alpha: alpha.max(1),
            exhaustive,
            candidates: Vec::new(),
            best: None,
            stale_replies: 0,
            sweeping: false,
        };
        for contact in seeds {
            state.insert(contact);
        }
        state
    }

    fn insert(&mut self, contact: Contact) -> bool {
        if contact.id == self.local_id || !contact.is_supported() {
            return false;
        }
        if self.candidates.iter().any(|c| c.contact.id == contact.id) {
            return false;
        }
        let distance = contact.id.distance(&self.target);
        let pos = self
            .candidates
            .partition_point(|c| (c.distance, c.contact.id) < (distance, contact.id));
        self.candidates.insert(
            pos,
            Candidate {
                contact,
                distance,
                progress: Progress::Unqueried,
            },
        );
        true
    }

    fn in_flight(&self) -> usize {
        self.candidates
            .iter()
            .filter(|c| c.progress == Progress::InFlight)
            .count()
    }

    /// Positions of the `k` closest candidates that have not failed
    fn window(&self) -> impl Iterator<Item = usize> + '_ {
        self.candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.progress != Progress::Failed)
            .take(self.k)
            .map(|(i, _)| i)
    }

    /// Next contact to query, if the lookup wants more requests in flight
    pub fn next_query(&mut self) -> Option<Contact> {
        if self.in_flight() >= self.alpha {
            return None;
        }
        let pos = self
            .window()
            .find(|&i| self.candidates[i].progress == Progress::Unqueried)?;
        let candidate = &mut self.candidates[pos];
        candidate.progress = Progress::InFlight;
        Some(candidate.contact.clone())
    }

    /// Record a reply from `responder` carrying `learned` contacts
    pub fn on_reply(&mut self, responder: &Contact, learned: Vec<Contact>) {
        if let Some(candidate) = self
            .candidates
            .iter_mut()
            .find(|c| c.contact.id == responder.id)
        {
            candidate.progress = Progress::Responded;
            let token = candidate.contact.spoof_token;
            candidate.contact = responder.clone();
            if candidate.contact.spoof_token.is_none() {
                candidate.contact.spoof_token = token;
            }
        }

        let mut improved = false;
        if !self.sweeping {
            for contact in learned {
                let distance = contact.id.distance(&self.target);
                if self.insert(contact) && self.best.is_none_or(|best| distance < best) {
                    improved = true;
                }
            }
        }
        let responded = responder.id.distance(&self.target);
        if self.best.is_none_or(|best| responded < best) {
            self.best = Some(responded);
        }

        if improved {
            self.stale_replies = 0;
        } else {
            self.stale_replies += 1;
            if !self.exhaustive && self.stale_replies >= self.alpha {
                self.sweeping = true;
            }
        }
    }

    /// Record a failed request to `id`
    pub fn on_failure(&mut self, id: &NodeId) {
        if let Some(candidate) = self.candidates.iter_mut().find(|c| c.contact.id == *id) {
            candidate.progress = Progress::Failed;
        }
    }

    /// Whether nothing is in flight and nothing is left to ask
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.in_flight() == 0
            && !self
                .window()
                .any(|i| self.candidates[i].progress == Progress::Unqueried)
    }

    /// Responders sorted by distance, at most `k`
    #[must_use]
    pub fn closest_responded(&self) -> Vec<Contact> {
        self.candidates
            .iter()
            .filter(|c| c.progress == Progress::Responded)
            .take(self.k)
            .map(|c| c.contact.clone())
            .collect()
    }
}

/// What a lookup walk asks each node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    /// FIND_NODE
    Node,
    /// FIND_VALUE; stop once this many values are known (0 means never)
    Value {
        /// Value limit
        max_values: u16,
    },
}

/// Result of a lookup walk
#[derive(Debug, Clone, Default)]
pub struct LookupOutcome {
    /// Closest contacts that answered, nearest first
    pub closest: Vec<Contact>,
    /// Values found, newest version per originator
    pub values: Vec<StoredValue>,
    /// Contacts that returned values
    pub holders: Vec<Contact>,
    /// Diversification reported by a holder
    pub diversification: Option<Diversification>,
    /// Key-block reported by a holder
    pub blocked: Option<KeyBlock>,
}

enum Answer {
    Nodes { contacts: Vec<Contact>, spoof_token: u32 },
    Value(FindValueReply),
}

impl DhtControl {
    /// Walk towards `target`, bounded by the lookup concurrency limit
    pub(crate) async fn iterate(
        self: &Arc<Self>,
        target: NodeId,
        kind: LookupKind,
        exhaustive: bool,
    ) -> LookupOutcome {
        let Ok(_permit) = self.lookups.acquire().await else {
            return LookupOutcome::default();
        };
        self.router().touch(&target);

        let seeds = self.router().find_closest(&target, self.config.k);
        let mut state = LookupState::new(
            target,
            self.local_id,
            seeds,
            self.config.k,
            self.config.alpha,
            exhaustive,
        );
        let options = RpcOptions::new(self.config.rpc_timeout());
        let mut outcome = LookupOutcome::default();
        let mut values: HashMap<NodeId, StoredValue> = HashMap::new();
        let mut in_flight = JoinSet::new();

        loop {
            while let Some(contact) = state.next_query() {
                let control = Arc::clone(self);
                in_flight.spawn(async move {
                    let answer = match kind {
                        LookupKind::Node => control
                            .transport
                            .find_node(&contact, target, options)
                            .await
                            .map(|(sender, contacts, spoof_token)| {
                                (sender, Answer::Nodes {
                                    contacts,
                                    spoof_token,
                                })
                            }),
                        LookupKind::Value { max_values } => control
                            .transport
                            .find_value(&contact, target, max_values, options)
                            .await
                            .map(|(sender, reply)| (sender, Answer::Value(reply))),
                    };
                    (contact, answer)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let Ok((queried, answer)) = joined else {
                continue;
            };

            match answer {
                Ok((mut sender, Answer::Nodes { contacts, spoof_token })) => {
                    sender.spoof_token = Some(spoof_token);
                    self.reply_received(&sender, &contacts);
                    state.on_reply(&sender, contacts);
                }
                Ok((sender, Answer::Value(reply))) => {
                    match reply {
                        FindValueReply::NotFound { contacts } => {
                            self.reply_received(&sender, &contacts);
                            state.on_reply(&sender, contacts);
                        }
                        FindValueReply::Found {
                            values: found,
                            diversification,
                        } => {
                            self.reply_received(&sender, &[]);
                            state.on_reply(&sender, Vec::new());
                            outcome.holders.push(sender);
                            if outcome.diversification.is_none() {
                                outcome.diversification = diversification;
                            }
                            for value in found {
                                merge_value(&mut values, value);
                            }
                        }
                        FindValueReply::Blocked(block) => {
                            self.reply_received(&sender, &[]);
                            if self.accept_remote_block(&sender, target, block.clone()) {
                                tracing::debug!("Lookup for {} hit a key-block", target);
                                outcome.blocked = Some(block);
                                in_flight.abort_all();
                                break;
                            }
                            state.on_reply(&sender, Vec::new());
                        }
                    }
                }
                Err(e) => {
                    self.request_failed(&queried, &e);
                    state.on_failure(&queried.id);
                }
            }

            if let LookupKind::Value { max_values } = kind {
                if max_values > 0 && values.len() >= usize::from(max_values) {
                    in_flight.abort_all();
                    break;
                }
            }
            if state.is_finished() && in_flight.is_empty() {
                break;
            }
        }

        outcome.closest = state.closest_responded();
        outcome.values = values.into_values().collect();
        outcome
            .values
            .sort_by(|a, b| b.created_ms.cmp(&a.created_ms));
        if let LookupKind::Value { max_values } = kind {
            if max_values > 0 {
                outcome.values.truncate(usize::from(max_values));
            }
        }
        tracing::trace!(
            "Lookup for {} finished: {} contacts, {} values",
            target,
            outcome.closest.len(),
            outcome.values.len()
        );
        outcome
    }

    /// Whether a key-block reported by `sender` for `key` verifies against
    /// the configured authority; a valid block is applied locally
    pub(crate) fn accept_remote_block(&self, sender: &Contact, key: NodeId, block: KeyBlock) -> bool {
        if block.key != key {
            tracing::debug!("{} sent a key-block for {} in reply about {}", sender, block.key, key);
            return false;
        }
        match self.db.apply_key_block(block) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("Ignoring key-block for {} from {}: {}", key, sender, e);
                false
            }
        }
    }

    /// Liveness bookkeeping for a reply
    pub(crate) fn reply_received(&self, sender: &Contact, learned: &[Contact]) {
        let mut router = self.router();
        router.contact_seen(sender.clone(), true);
        for contact in learned {
            router.contact_seen(contact.clone(), false);
        }
    }

    /// Liveness bookkeeping for a failed request
    pub(crate) fn request_failed(&self, contact: &Contact, error: &RpcError) {
        tracing::trace!("Request to {} failed: {}", contact, error);
        self.router().contact_failed(&contact.id);
    }
}

/// Keep the newest version per (key, originator)
fn merge_value(values: &mut HashMap<NodeId, StoredValue>, value: StoredValue) {
    let slot = NodeId::hash(&[value.key.as_bytes().as_slice(), value.originator.id.as_bytes()].concat());
    match values.get(&slot) {
        Some(existing) if existing.version >= value.version => {}
        _ => {
            values.insert(slot, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(byte: u8) -> Contact {
        let mut bytes = [0u8; 32];
        bytes[0] = byte;
        let addr = format!("10.0.0.{byte}:6881").parse().unwrap();
        Contact::new(NodeId::from_bytes(bytes), addr)
    }

    #[test]
    fn test_queries_closest_first_with_alpha_limit() {
        let seeds = vec![contact(0x40), contact(0x01), contact(0x80), contact(0x02)];
        let mut state = LookupState::new(NodeId::ZERO, contact(0xFF).id, seeds, 20, 2, false);

        assert_eq!(state.next_query().unwrap().id, contact(0x01).id);
        assert_eq!(state.next_query().unwrap().id, contact(0x02).id);
        assert!(state.next_query().is_none());
        assert!(!state.is_finished());
    }

    #[test]
    fn test_learned_contacts_are_queried() {
        let mut state = LookupState::new(NodeId::ZERO, contact(0xFF).id, vec![contact(0x80)], 20, 3, false);
        let first = state.next_query().unwrap();
        state.on_reply(&first, vec![contact(0x10), contact(0x08)]);

        assert_eq!(state.next_query().unwrap().id, contact(0x08).id);
        assert_eq!(state.next_query().unwrap().id, contact(0x10).id);
    }

    #[test]
    fn test_failures_do_not_abort() {
        let seeds = vec![contact(0x01), contact(0x02)];
        let mut state = LookupState::new(NodeId::ZERO, contact(0xFF).id, seeds, 20, 2, false);
        let a = state.next_query().unwrap();
        let b = state.next_query().unwrap();
        state.on_failure(&a.id);
        state.on_reply(&b, vec![]);
        assert!(state.is_finished());
        let closest = state.closest_responded();
        assert_eq!(closest.len(), 1);
        assert_eq!(closest[0].id, b.id);
    }

    #[test]
    fn test_local_id_never_queried() {
        let me = contact(0x01);
        let mut state = LookupState::new(NodeId::ZERO, me.id, vec![me.clone(), contact(0x02)], 20, 3, false);
        assert_eq!(state.next_query().unwrap().id, contact(0x02).id);
        assert!(state.next_query().is_none());
    }

    #[test]
    fn test_stale_round_freezes_candidates() {
        let seeds = vec![contact(0x01), contact(0x02)];
        let mut state = LookupState::new(NodeId::ZERO, contact(0xFF).id, seeds, 20, 2, false);
        let a = state.next_query().unwrap();
        let b = state.next_query().unwrap();
        state.on_reply(&a, vec![]);
        state.on_reply(&b, vec![]);
        // a full round without improvement: new contacts are ignored
        state.on_reply(&a, vec![contact(0x03)]);
        assert!(state.next_query().is_none());
        assert!(state.is_finished());
    }

    #[test]
    fn test_exhaustive_keeps_exploring() {
        let seeds = vec![contact(0x01), contact(0x02)];
        let mut state = LookupState::new(NodeId::ZERO, contact(0xFF).id, seeds, 20, 2, true);
        let a = state.next_query().unwrap();
        let b = state.next_query().unwrap();
        state.on_reply(&a, vec![]);
        state.on_reply(&b, vec![contact(0x40)]);
        assert_eq!(state.next_query().unwrap().id, contact(0x40).id);
    }

    #[test]
    fn test_spoof_token_kept_on_responder() {
        let mut state = LookupState::new(NodeId::ZERO, contact(0xFF).id, vec![contact(0x01)], 20, 1, false);
        let queried = state.next_query().unwrap();
        let mut responder = queried.clone();
        responder.spoof_token = Some(77);
        state.on_reply(&responder, vec![]);
        assert_eq!(state.closest_responded()[0].spoof_token, Some(77));
    }

    #[test]
    fn test_merge_keeps_newest_version() {
        let origin = contact(0x05);
        let value = |version: u32| StoredValue {
            key: NodeId::ZERO,
            payload: vec![version as u8],
            flags: 0,
            life_hours: 0,
            replication_control: Default::default(),
            originator: origin.clone(),
            created_ms: u64::from(version),
            version,
            local: false,
            diversification: Default::default(),
        };
        let mut values = HashMap::new();
        merge_value(&mut values, value(2));
        merge_value(&mut values, value(1));
        merge_value(&mut values, value(3));
        assert_eq!(values.len(), 1);
        assert_eq!(values.values().next().unwrap().version, 3);
    }
}
