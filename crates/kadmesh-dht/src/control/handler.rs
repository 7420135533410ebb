//! Inbound request handling
//!
//! Every request refreshes the sender in the routing table before it is
//! served. STOREs must carry the anti-spoof token this node issued to the
//! sender's address in an earlier FIND_NODE reply, which proves the sender
//! can receive traffic at the address it claims.

use super::DhtControl;
use crate::bloom::address_key;
use crate::contact::Contact;
use crate::db::DbLookup;
use crate::rpc::RequestHandler;
use crate::rpc::messages::{FindValueReply, RemoteStats, Reply, Request, StoreOutcome};
use std::net::SocketAddr;

/// Issues and checks anti-spoof tokens.
///
/// A token is a keyed hash of the requester's IP under a per-instance
/// secret, so it survives NAT port changes but not a restart.
pub struct SpoofTokens {
    secret: [u8; 32],
}

impl SpoofTokens {
    /// Create with a random secret
    #[must_use]
    pub fn new() -> Self {
        Self {
            secret: rand::random(),
        }
    }

    /// Token for `addr`
    #[must_use]
    pub fn token_for(&self, addr: &SocketAddr) -> u32 {
        let hash = blake3::keyed_hash(&self.secret, &address_key(addr));
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&hash.as_bytes()[..4]);
        u32::from_be_bytes(bytes)
    }

    /// Whether `token` is the one issued to `addr`
    #[must_use]
    pub fn verify(&self, addr: &SocketAddr, token: u32) -> bool {
        self.token_for(addr) == token
    }
}

impl Default for SpoofTokens {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SpoofTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SpoofTokens")
    }
}

impl RequestHandler for DhtControl {
    fn handle_request(&self, from: &Contact, request: Request) -> Reply {
        if from.id != self.local_id {
            self.router().contact_seen(from.clone(), true);
        }

        match request {
            Request::Ping => Reply::Pong,

            Request::Store {
                spoof_token,
                values,
            } => {
                if !self.spoof.verify(&from.addr, spoof_token) {
                    tracing::debug!("Store from {} with bad spoof token", from);
                    return Reply::Store(StoreOutcome::SpoofRejected);
                }
                tracing::trace!("Store of {} values from {}", values.len(), from);
                Reply::Store(self.db.store_remote(from, from.addr, values))
            }

            Request::FindNode { target } => Reply::FindNode {
                contacts: self.router().find_closest(&target, self.config.k),
                spoof_token: self.spoof.token_for(&from.addr),
            },

            Request::FindValue { key, max_values } => {
                match self.db.get(&key, usize::from(max_values)) {
                    DbLookup::Blocked(block) => Reply::FindValue(FindValueReply::Blocked(block)),
                    DbLookup::Values {
                        values,
                        diversification: None,
                    } if values.is_empty() => {
                        Reply::FindValue(FindValueReply::NotFound {
                            contacts: self.router().find_closest(&key, self.config.k),
                        })
                    }
                    DbLookup::Values {
                        values,
                        diversification,
                    } => Reply::FindValue(FindValueReply::Found {
                        values,
                        diversification,
                    }),
                }
            }

            Request::KeyBlock(block) => {
                let key = block.key;
                match self.db.apply_key_block(block) {
                    Ok(_) => Reply::KeyBlock { accepted: true },
                    Err(e) => {
                        tracing::debug!("Rejected key-block for {} from {}: {}", key, from, e);
                        Reply::KeyBlock { accepted: false }
                    }
                }
            }

            Request::QueryStore { entries } => Reply::QueryStore {
                missing: self.db.query_store(&entries),
            },

            Request::Stats => {
                let db = self.db.stats();
                Reply::Stats(RemoteStats {
                    db_keys: db.keys as u64,
                    db_values: (db.remote_values + db.local_values) as u64,
                    contacts: self.router().len() as u64,
                    uptime_secs: self.started.elapsed().as_secs(),
                })
            }
        }
    }
}
