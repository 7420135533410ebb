//! RPC layer
//!
//! [`DhtTransport`] is the capability the control layer drives: send a
//! request to a contact and await its reply or a failure. Two
//! implementations exist, [`udp::UdpDhtTransport`] for the real network and
//! [`loopback::LoopbackTransport`] for deterministic in-process tests. Both
//! hand inbound requests to a [`RequestHandler`], so request semantics live
//! in one place regardless of transport.

pub mod loopback;
pub mod messages;
pub mod tunnel;
pub mod udp;

use crate::contact::Contact;
use crate::db::key_block::KeyBlock;
use crate::db::value::StoredValue;
use crate::node_id::NodeId;
use async_trait::async_trait;
use messages::{ErrorCode, FindValueReply, RemoteStats, Reply, Request, RequestKind, StoreOutcome};
use std::net::SocketAddr;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// RPC failures. All of them are recoverable and feed liveness tracking.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// No reply within the timeout
    #[error("Request to {addr} timed out")]
    Timeout {
        /// Destination
        addr: SocketAddr,
    },

    /// No node listens at the address
    #[error("{0} is unreachable")]
    Unreachable(SocketAddr),

    /// Request failed for another reason
    #[error("Request failed: {0}")]
    Failed(String),

    /// Datagram could not be sent
    #[error("Send failed: {0}")]
    Send(String),

    /// Peer speaks an unsupported protocol version
    #[error("Unsupported protocol version {version}")]
    ProtocolMismatch {
        /// Version the peer sent
        version: u8,
    },

    /// Peer answered with an error reply
    #[error("Remote error: {0:?}")]
    Remote(ErrorCode),

    /// Reply type does not match the request
    #[error("Unexpected reply")]
    UnexpectedReply,

    /// Transport closed
    #[error("Transport closed")]
    Closed,

    /// Request could not be encoded
    #[error("Encode failed: {0}")]
    Encode(String),
}

/// Result type for RPCs
pub type RpcResult<T> = Result<T, RpcError>;

/// Request priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Bypasses the low-priority concurrency gate
    High,
    /// Waits for a low-priority slot
    #[default]
    Low,
}

/// Per-request options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcOptions {
    /// Reply timeout
    pub timeout: Duration,
    /// Priority
    pub priority: Priority,
}

impl RpcOptions {
    /// Low-priority request with `timeout`
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            priority: Priority::Low,
        }
    }

    /// Same options at high priority
    #[must_use]
    pub fn high_priority(mut self) -> Self {
        self.priority = Priority::High;
        self
    }

    /// Same options at `priority`
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Serves inbound requests.
///
/// `from` is the sender's contact with its address replaced by the address
/// the request actually arrived from.
pub trait RequestHandler: Send + Sync {
    /// Produce the reply to `request`
    fn handle_request(&self, from: &Contact, request: Request) -> Reply;
}

/// Counters for one request kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindStats {
    /// Requests sent
    pub sent: u64,
    /// Requests answered
    pub succeeded: u64,
    /// Requests failed or timed out
    pub failed: u64,
    /// Requests received
    pub received: u64,
    /// Requests received from alien sources
    pub alien: u64,
}

/// Snapshot of a transport's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcStats {
    /// Counters indexed by [`RequestKind::index`]
    pub kinds: [KindStats; RequestKind::ALL.len()],
}

impl RpcStats {
    /// Counters for `kind`
    #[must_use]
    pub fn get(&self, kind: RequestKind) -> KindStats {
        self.kinds[kind.index()]
    }

    /// Counters summed over every kind
    #[must_use]
    pub fn total(&self) -> KindStats {
        self.kinds.iter().fold(KindStats::default(), |acc, k| KindStats {
            sent: acc.sent + k.sent,
            succeeded: acc.succeeded + k.succeeded,
            failed: acc.failed + k.failed,
            received: acc.received + k.received,
            alien: acc.alien + k.alien,
        })
    }
}

#[derive(Debug, Default)]
struct KindCounters {
    sent: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    received: AtomicU64,
    alien: AtomicU64,
}

/// Lock-free per-kind request counters shared by the transports
#[derive(Debug, Default)]
pub struct RpcCounters {
    kinds: [KindCounters; RequestKind::ALL.len()],
}

impl RpcCounters {
    /// Count an outbound request
    pub fn record_sent(&self, kind: RequestKind) {
        self.kinds[kind.index()].sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an answered request
    pub fn record_success(&self, kind: RequestKind) {
        self.kinds[kind.index()]
            .succeeded
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed request
    pub fn record_failure(&self, kind: RequestKind) {
        self.kinds[kind.index()].failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an inbound request
    pub fn record_received(&self, kind: RequestKind, alien: bool) {
        let counters = &self.kinds[kind.index()];
        counters.received.fetch_add(1, Ordering::Relaxed);
        if alien {
            counters.alien.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot
    #[must_use]
    pub fn snapshot(&self) -> RpcStats {
        let mut stats = RpcStats::default();
        for (out, counters) in stats.kinds.iter_mut().zip(&self.kinds) {
            *out = KindStats {
                sent: counters.sent.load(Ordering::Relaxed),
                succeeded: counters.succeeded.load(Ordering::Relaxed),
                failed: counters.failed.load(Ordering::Relaxed),
                received: counters.received.load(Ordering::Relaxed),
                alien: counters.alien.load(Ordering::Relaxed),
            };
        }
        stats
    }
}

/// Request/reply transport between DHT nodes
#[async_trait]
pub trait DhtTransport: Send + Sync {
    /// This node as other nodes should see it
    fn local_contact(&self) -> Contact;

    /// Install the handler for inbound requests
    fn set_request_handler(&self, handler: Weak<dyn RequestHandler>);

    /// Send `request` to `to` and await the reply.
    ///
    /// On success returns the responder's contact (with its observed
    /// address) and its reply. `Reply::Error` is returned as
    /// `RpcError::Remote`.
    async fn request(
        &self,
        to: &Contact,
        request: Request,
        options: RpcOptions,
    ) -> RpcResult<(Contact, Reply)>;

    /// Counter snapshot
    fn stats(&self) -> RpcStats;

    /// Whether unsolicited traffic suggests other nodes can reach us
    fn is_reachable(&self) -> bool {
        true
    }

    /// Periodic maintenance, called on the router tick
    fn tick(&self) {}

    /// Advertise the sleeping flag on outgoing packets
    fn set_sleeping(&self, sleeping: bool);

    /// Stop or resume serving inbound requests. Suspended transports drop
    /// requests unanswered; outbound requests still work.
    fn set_suspended(&self, suspended: bool);

    /// Stop serving and fail outstanding requests
    async fn close(&self);
}

/// Typed request helpers over any [`DhtTransport`]
#[async_trait]
pub trait DhtTransportExt: DhtTransport {
    /// PING; returns the responder's contact
    async fn ping(&self, to: &Contact, options: RpcOptions) -> RpcResult<Contact> {
        match self.request(to, Request::Ping, options).await? {
            (sender, Reply::Pong) => Ok(sender),
            _ => Err(RpcError::UnexpectedReply),
        }
    }

    /// STORE
    async fn store(
        &self,
        to: &Contact,
        spoof_token: u32,
        values: Vec<StoredValue>,
        options: RpcOptions,
    ) -> RpcResult<(Contact, StoreOutcome)> {
        let request = Request::Store {
            spoof_token,
            values,
        };
        match self.request(to, request, options).await? {
            (sender, Reply::Store(outcome)) => Ok((sender, outcome)),
            _ => Err(RpcError::UnexpectedReply),
        }
    }

    /// FIND_NODE; returns the responder, its contacts and the anti-spoof
    /// token it issued to us
    async fn find_node(
        &self,
        to: &Contact,
        target: NodeId,
        options: RpcOptions,
    ) -> RpcResult<(Contact, Vec<Contact>, u32)> {
        match self.request(to, Request::FindNode { target }, options).await? {
            (sender, Reply::FindNode {
                contacts,
                spoof_token,
            }) => Ok((sender, contacts, spoof_token)),
            _ => Err(RpcError::UnexpectedReply),
        }
    }

    /// FIND_VALUE
    async fn find_value(
        &self,
        to: &Contact,
        key: NodeId,
        max_values: u16,
        options: RpcOptions,
    ) -> RpcResult<(Contact, FindValueReply)> {
        let request = Request::FindValue { key, max_values };
        match self.request(to, request, options).await? {
            (sender, Reply::FindValue(reply)) => Ok((sender, reply)),
            _ => Err(RpcError::UnexpectedReply),
        }
    }

    /// KEY_BLOCK; returns whether the receiver applied the block
    async fn key_block(&self, to: &Contact, block: KeyBlock, options: RpcOptions) -> RpcResult<bool> {
        match self.request(to, Request::KeyBlock(block), options).await? {
            (_, Reply::KeyBlock { accepted }) => Ok(accepted),
            _ => Err(RpcError::UnexpectedReply),
        }
    }

    /// QUERY_STORE; returns the indexes of entries the receiver lacks
    async fn query_store(
        &self,
        to: &Contact,
        entries: Vec<(NodeId, u64)>,
        options: RpcOptions,
    ) -> RpcResult<Vec<u32>> {
        match self.request(to, Request::QueryStore { entries }, options).await? {
            (_, Reply::QueryStore { missing }) => Ok(missing),
            _ => Err(RpcError::UnexpectedReply),
        }
    }

    /// STATS
    async fn remote_stats(&self, to: &Contact, options: RpcOptions) -> RpcResult<RemoteStats> {
        match self.request(to, Request::Stats, options).await? {
            (_, Reply::Stats(stats)) => Ok(stats),
            _ => Err(RpcError::UnexpectedReply),
        }
    }
}

impl<T: DhtTransport + ?Sized> DhtTransportExt for T {}

/// Map an error reply to `RpcError::Remote`
fn check_reply(reply: Reply) -> RpcResult<Reply> {
    match reply {
        Reply::Error(code) => Err(RpcError::Remote(code)),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let counters = RpcCounters::default();
        counters.record_sent(RequestKind::Ping);
        counters.record_sent(RequestKind::Ping);
        counters.record_success(RequestKind::Ping);
        counters.record_failure(RequestKind::Store);
        counters.record_received(RequestKind::FindValue, true);
        counters.record_received(RequestKind::FindValue, false);

        let stats = counters.snapshot();
        assert_eq!(stats.get(RequestKind::Ping).sent, 2);
        assert_eq!(stats.get(RequestKind::Ping).succeeded, 1);
        assert_eq!(stats.get(RequestKind::Store).failed, 1);
        assert_eq!(stats.get(RequestKind::FindValue).received, 2);
        assert_eq!(stats.get(RequestKind::FindValue).alien, 1);
        assert_eq!(stats.total().sent, 2);
        assert_eq!(stats.total().received, 2);
    }

    #[test]
    fn test_options() {
        let options = RpcOptions::new(Duration::from_secs(1));
        assert_eq!(options.priority, Priority::Low);
        assert_eq!(options.high_priority().priority, Priority::High);
    }

    #[test]
    fn test_error_replies_mapped() {
        assert_eq!(
            check_reply(Reply::Error(ErrorCode::Unavailable)),
            Err(RpcError::Remote(ErrorCode::Unavailable))
        );
        assert_eq!(check_reply(Reply::Pong), Ok(Reply::Pong));
    }
}
