//! UDP transport
//!
//! Registers one network on a shared port through the [`MuxRegistry`] and
//! correlates replies with requests by transaction id. Inbound requests pass
//! the alien check before reaching the [`RequestHandler`]; the alien counts
//! drive the reachability estimate.

use super::messages::{Body, ErrorCode, Packet, Reply, Request, RequestKind};
use super::tunnel::BootstrapTunnel;
use super::{
    DhtTransport, Priority, RequestHandler, RpcCounters, RpcError, RpcOptions, RpcResult,
    RpcStats, check_reply,
};
use crate::bloom::BloomWindow;
use crate::config::DhtConfig;
use crate::contact::{Contact, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
use crate::error::DhtError;
use crate::node_id::NodeId;
use async_trait::async_trait;
use dashmap::DashMap;
use kadmesh_transport::mux::NETWORK_HEADER_LEN;
use kadmesh_transport::{MuxRegistry, NetworkHandle, NetworkId, PacketHandler, TransportStats};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use tokio::sync::{Semaphore, oneshot};

/// Smoothing factor of the alien-rate averages
const REACHABILITY_ALPHA: f64 = 0.2;

/// Average alien FIND_VALUE requests per tick that imply reachability
const REACHABLE_FIND_VALUE_RATE: f64 = 1.0;

/// Average alien requests per tick that imply reachability
const REACHABLE_TOTAL_RATE: f64 = 3.0;

struct Pending {
    addr: SocketAddr,
    reply: oneshot::Sender<Packet>,
}

#[derive(Debug, Default)]
struct Reachability {
    last_find_value: u64,
    last_total: u64,
    find_value_avg: f64,
    total_avg: f64,
}

/// DHT transport over a multiplexed UDP port
pub struct UdpDhtTransport {
    handle: NetworkHandle,
    registry: Arc<MuxRegistry>,
    local: RwLock<Contact>,
    handler: RwLock<Option<Weak<dyn RequestHandler>>>,
    pending: DashMap<u64, Pending>,
    next_transaction: AtomicU64,
    low_priority: Semaphore,
    window: BloomWindow,
    counters: RpcCounters,
    reachability: Mutex<Reachability>,
    reachable: AtomicBool,
    tunnel: Option<BootstrapTunnel>,
    suspended: AtomicBool,
    closed: AtomicBool,
}

/// Mux-side receiver; holds the transport weakly so the registry does not
/// keep it alive
#[derive(Default)]
struct Inbound {
    transport: OnceLock<Weak<UdpDhtTransport>>,
}

#[async_trait]
impl PacketHandler for Inbound {
    async fn handle_packet(&self, payload: Vec<u8>, from: SocketAddr) {
        let Some(transport) = self.transport.get().and_then(Weak::upgrade) else {
            return;
        };
        transport.handle_datagram(&payload, from).await;
    }
}

impl UdpDhtTransport {
    /// Register on `config.bind_addr` for `config.network`.
    ///
    /// # Errors
    ///
    /// - `DhtError::Mux` if binding or registration fails
    /// - `DhtError::InvalidConfig` for a bad alien window or tunnel
    pub async fn bind(
        registry: Arc<MuxRegistry>,
        config: &DhtConfig,
        local_id: NodeId,
        instance_id: u32,
    ) -> Result<Arc<Self>, DhtError> {
        let cells = u32::try_from(config.alien_window_cells)
            .map_err(|_| DhtError::InvalidConfig("alien_window_cells too large".into()))?;
        let window = BloomWindow::new(cells, config.alien_window_period())
            .map_err(|e| DhtError::InvalidConfig(e.to_string().into()))?;
        let tunnel = config
            .tunnel
            .as_ref()
            .map(|t| BootstrapTunnel::new(t.seed, &t.url))
            .transpose()
            .map_err(|e| DhtError::InvalidConfig(e.to_string().into()))?;

        let inbound = Arc::new(Inbound::default());
        let handle = registry
            .register(config.bind_addr, config.network, inbound.clone())
            .await?;

        let addr = match config.external_addr {
            Some(addr) => addr,
            None => handle.local_addr()?,
        };
        let transport = Arc::new(Self {
            handle,
            registry,
            local: RwLock::new(Contact::new(local_id, addr).with_instance(instance_id)),
            handler: RwLock::new(None),
            pending: DashMap::new(),
            next_transaction: AtomicU64::new(rand::random()),
            low_priority: Semaphore::new(config.max_low_priority_outstanding),
            window,
            counters: RpcCounters::default(),
            reachability: Mutex::new(Reachability::default()),
            reachable: AtomicBool::new(false),
            tunnel,
            suspended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        let _ = inbound.transport.set(Arc::downgrade(&transport));
        tracing::info!(
            "DHT transport for network {} on {}",
            transport.handle.network(),
            addr
        );
        Ok(transport)
    }

    /// Network id this transport serves
    #[must_use]
    pub fn network(&self) -> NetworkId {
        self.handle.network()
    }

    /// Locally bound address
    ///
    /// # Errors
    ///
    /// Returns `DhtError::Mux` if the socket cannot report its address
    pub fn local_addr(&self) -> Result<SocketAddr, DhtError> {
        Ok(self.handle.local_addr()?)
    }

    /// Byte and packet counters of this network
    #[must_use]
    pub fn transport_stats(&self) -> TransportStats {
        self.handle.stats()
    }

    /// Serve a datagram that arrived over the seed's HTTP tunnel.
    ///
    /// `datagram` includes the network header; the returned reply does too.
    /// Returns `None` for datagrams that are not requests for this network.
    pub fn handle_tunnelled_request(&self, datagram: &[u8], from: SocketAddr) -> Option<Vec<u8>> {
        let payload = self.strip_header(datagram)?;
        let packet = Packet::from_bytes(payload).ok()?;
        if !matches!(packet.body, Body::Request(_)) {
            return None;
        }
        let reply = self.process_request(packet, from)?;
        let bytes = reply.to_bytes().ok()?;
        Some(self.with_header(&bytes))
    }

    fn strip_header<'a>(&self, datagram: &'a [u8]) -> Option<&'a [u8]> {
        if datagram.len() < NETWORK_HEADER_LEN {
            return None;
        }
        let (header, payload) = datagram.split_at(NETWORK_HEADER_LEN);
        let mut network = [0u8; NETWORK_HEADER_LEN];
        network.copy_from_slice(header);
        (NetworkId::from_be_bytes(network) == self.handle.network()).then_some(payload)
    }

    fn with_header(&self, payload: &[u8]) -> Vec<u8> {
        let mut datagram = Vec::with_capacity(NETWORK_HEADER_LEN + payload.len());
        datagram.extend_from_slice(&self.handle.network().to_be_bytes());
        datagram.extend_from_slice(payload);
        datagram
    }

    async fn handle_datagram(&self, payload: &[u8], from: SocketAddr) {
        let packet = match Packet::from_bytes(payload) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("Dropping malformed packet from {}: {}", from, e);
                return;
            }
        };

        match packet.body {
            Body::Reply(_) => self.handle_reply(packet, from),
            Body::Request(_) => {
                let Some(reply) = self.process_request(packet, from) else {
                    return;
                };
                match reply.to_bytes() {
                    Ok(bytes) => {
                        if let Err(e) = self.handle.send(&bytes, from).await {
                            tracing::debug!("Reply to {} failed: {}", from, e);
                        }
                    }
                    Err(e) => tracing::warn!("Cannot encode reply to {}: {}", from, e),
                }
            }
        }
    }

    fn handle_reply(&self, packet: Packet, from: SocketAddr) {
        let Some((_, pending)) = self
            .pending
            .remove_if(&packet.transaction_id, |_, p| p.addr == from)
        else {
            tracing::trace!(
                "Unmatched reply {} from {}",
                packet.transaction_id,
                from
            );
            return;
        };
        let _ = pending.reply.send(packet);
    }

    /// Run the alien check and the handler; returns the reply packet
    fn process_request(&self, packet: Packet, from: SocketAddr) -> Option<Packet> {
        let Body::Request(request) = packet.body else {
            return None;
        };
        if self.suspended.load(Ordering::Acquire) {
            tracing::trace!("Suspended, dropping request from {}", from);
            return None;
        }
        let kind = request.kind();
        let alien = self.window.check_address(&from);
        self.counters.record_received(kind, alien);

        let mut sender = packet.sender;
        sender.addr = from;
        sender.version = packet.protocol_version;

        let reply = if packet.protocol_version < MIN_PROTOCOL_VERSION {
            tracing::debug!(
                "Rejecting {} from {}: protocol version {}",
                kind.name(),
                from,
                packet.protocol_version
            );
            Reply::Error(ErrorCode::UnsupportedVersion {
                min: MIN_PROTOCOL_VERSION,
            })
        } else if self.closed.load(Ordering::Acquire) {
            Reply::Error(ErrorCode::Unavailable)
        } else {
            let handler = self
                .handler
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
                .and_then(Weak::upgrade);
            match handler {
                Some(handler) => handler.handle_request(&sender, request),
                None => Reply::Error(ErrorCode::Unavailable),
            }
        };

        Some(Packet {
            transaction_id: packet.transaction_id,
            protocol_version: PROTOCOL_VERSION,
            sender: self.local_contact(),
            body: Body::Reply(reply),
        })
    }

    fn accept_reply(&self, kind: RequestKind, packet: Packet, addr: SocketAddr) -> RpcResult<(Contact, Reply)> {
        if packet.protocol_version < MIN_PROTOCOL_VERSION {
            tracing::debug!(
                "Reply from {} has unsupported version {}",
                addr,
                packet.protocol_version
            );
            return Err(RpcError::ProtocolMismatch {
                version: packet.protocol_version,
            });
        }
        let Body::Reply(reply) = packet.body else {
            return Err(RpcError::UnexpectedReply);
        };
        let mut sender = packet.sender;
        sender.addr = addr;
        sender.version = packet.protocol_version;
        let reply = check_reply(reply)?;
        self.counters.record_success(kind);
        Ok((sender, reply))
    }

    async fn request_via_tunnel(
        &self,
        tunnel: &BootstrapTunnel,
        kind: RequestKind,
        bytes: &[u8],
        to: SocketAddr,
    ) -> RpcResult<(Contact, Reply)> {
        tracing::debug!("Tunnelling {} to seed {}", kind.name(), to);
        let reply = tunnel
            .exchange(&self.with_header(bytes))
            .await
            .map_err(|e| RpcError::Failed(e.to_string()))?;
        let payload = self
            .strip_header(&reply)
            .ok_or_else(|| RpcError::Failed("tunnel reply for another network".to_string()))?;
        let packet = Packet::from_bytes(payload).map_err(|e| RpcError::Failed(e.to_string()))?;
        self.accept_reply(kind, packet, to)
    }

    fn update_reachability(&self) {
        let stats = self.counters.snapshot();
        let find_value = stats.get(RequestKind::FindValue).alien;
        let total = stats.total().alien;

        let mut state = self.reachability.lock().unwrap_or_else(|e| e.into_inner());
        let find_value_delta = find_value.saturating_sub(state.last_find_value) as f64;
        let total_delta = total.saturating_sub(state.last_total) as f64;
        state.last_find_value = find_value;
        state.last_total = total;
        state.find_value_avg += REACHABILITY_ALPHA * (find_value_delta - state.find_value_avg);
        state.total_avg += REACHABILITY_ALPHA * (total_delta - state.total_avg);

        let reachable = state.find_value_avg > REACHABLE_FIND_VALUE_RATE
            || state.total_avg > REACHABLE_TOTAL_RATE;
        if self.reachable.swap(reachable, Ordering::AcqRel) != reachable {
            tracing::info!(
                "Reachability changed: {} (alien find_value {:.2}/tick, all {:.2}/tick)",
                reachable,
                state.find_value_avg,
                state.total_avg
            );
        }
    }
}

#[async_trait]
impl DhtTransport for UdpDhtTransport {
    fn local_contact(&self) -> Contact {
        self.local.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_request_handler(&self, handler: Weak<dyn RequestHandler>) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    async fn request(
        &self,
        to: &Contact,
        request: Request,
        options: RpcOptions,
    ) -> RpcResult<(Contact, Reply)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Closed);
        }
        let kind = request.kind();
        let _permit = match options.priority {
            Priority::Low => Some(
                self.low_priority
                    .acquire()
                    .await
                    .map_err(|_| RpcError::Closed)?,
            ),
            Priority::High => None,
        };

        let transaction_id = self.next_transaction.fetch_add(1, Ordering::Relaxed);
        let packet = Packet {
            transaction_id,
            protocol_version: PROTOCOL_VERSION,
            sender: self.local_contact(),
            body: Body::Request(request),
        };
        let bytes = packet
            .to_bytes()
            .map_err(|e| RpcError::Encode(e.to_string()))?;
        self.counters.record_sent(kind);
        self.window.update_address(&to.addr);

        if let Some(tunnel) = &self.tunnel {
            if kind == RequestKind::FindNode && tunnel.seed() == to.addr {
                let result = self.request_via_tunnel(tunnel, kind, &bytes, to.addr).await;
                if result.is_err() {
                    self.counters.record_failure(kind);
                }
                return result;
            }
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            transaction_id,
            Pending {
                addr: to.addr,
                reply: tx,
            },
        );

        if let Err(e) = self.handle.send(&bytes, to.addr).await {
            self.pending.remove(&transaction_id);
            self.counters.record_failure(kind);
            return Err(RpcError::Send(e.to_string()));
        }

        let result = match tokio::time::timeout(options.timeout, rx).await {
            Ok(Ok(packet)) => self.accept_reply(kind, packet, to.addr),
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => {
                self.pending.remove(&transaction_id);
                Err(RpcError::Timeout { addr: to.addr })
            }
        };
        if result.is_err() {
            self.counters.record_failure(kind);
        }
        result
    }

    fn stats(&self) -> RpcStats {
        self.counters.snapshot()
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    fn tick(&self) {
        self.update_reachability();
    }

    fn set_sleeping(&self, sleeping: bool) {
        self.local.write().unwrap_or_else(|e| e.into_inner()).sleeping = sleeping;
    }

    fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.low_priority.close();
        self.pending.clear();
        self.registry
            .unregister(self.handle.port(), self.handle.network())
            .await;
        tracing::info!("DHT transport for network {} closed", self.handle.network());
    }
}

impl std::fmt::Debug for UdpDhtTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpDhtTransport")
            .field("local", &self.local_contact())
            .field("network", &self.handle.network())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::DhtTransportExt;
    use std::time::Duration;

    struct Echo;

    impl RequestHandler for Echo {
        fn handle_request(&self, _from: &Contact, request: Request) -> Reply {
            match request {
                Request::Ping => Reply::Pong,
                Request::FindNode { .. } => Reply::FindNode {
                    contacts: vec![],
                    spoof_token: 42,
                },
                _ => Reply::Error(ErrorCode::Malformed),
            }
        }
    }

    fn local_config(network: NetworkId) -> DhtConfig {
        DhtConfig {
            network,
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..DhtConfig::default()
        }
    }

    fn options() -> RpcOptions {
        RpcOptions::new(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_ping_between_transports() {
        let registry = Arc::new(MuxRegistry::new());
        let a = UdpDhtTransport::bind(registry.clone(), &local_config(1), NodeId::random(), 1)
            .await
            .unwrap();
        let b = UdpDhtTransport::bind(registry.clone(), &local_config(1), NodeId::random(), 2)
            .await
            .unwrap();
        let handler: Arc<dyn RequestHandler> = Arc::new(Echo);
        b.set_request_handler(Arc::downgrade(&handler));

        let responder = a.ping(&b.local_contact(), options()).await.unwrap();
        assert_eq!(responder.id, b.local_contact().id);
        assert_eq!(responder.instance_id, 2);

        let (_, contacts, token) = a
            .find_node(&b.local_contact(), NodeId::ZERO, options())
            .await
            .unwrap();
        assert!(contacts.is_empty());
        assert_eq!(token, 42);

        let stats = a.stats();
        assert_eq!(stats.get(RequestKind::Ping).succeeded, 1);
        let stats = b.stats();
        assert_eq!(stats.get(RequestKind::Ping).received, 1);
        // a contacted b first, b did not contact a: a's requests are alien at b
        assert_eq!(stats.get(RequestKind::Ping).alien, 1);
        assert_eq!(stats.get(RequestKind::FindNode).alien, 0);
    }

    #[tokio::test]
    async fn test_error_reply_and_timeout() {
        let registry = Arc::new(MuxRegistry::new());
        let a = UdpDhtTransport::bind(registry.clone(), &local_config(3), NodeId::random(), 1)
            .await
            .unwrap();
        let b = UdpDhtTransport::bind(registry.clone(), &local_config(3), NodeId::random(), 2)
            .await
            .unwrap();

        // No handler installed yet
        let result = a.ping(&b.local_contact(), options()).await;
        assert_eq!(result, Err(RpcError::Remote(ErrorCode::Unavailable)));

        let handler: Arc<dyn RequestHandler> = Arc::new(Echo);
        b.set_request_handler(Arc::downgrade(&handler));
        let result = a.remote_stats(&b.local_contact(), options()).await;
        assert_eq!(result, Err(RpcError::Remote(ErrorCode::Malformed)));

        let addr = b.local_contact().addr;
        b.close().await;
        let result = a
            .ping(&b.local_contact(), RpcOptions::new(Duration::from_millis(200)))
            .await;
        assert_eq!(result, Err(RpcError::Timeout { addr }));
        assert_eq!(a.stats().get(RequestKind::Ping).failed, 2);
    }

    #[tokio::test]
    async fn test_suspended_transport_stays_silent() {
        let registry = Arc::new(MuxRegistry::new());
        let a = UdpDhtTransport::bind(registry.clone(), &local_config(4), NodeId::random(), 1)
            .await
            .unwrap();
        let b = UdpDhtTransport::bind(registry.clone(), &local_config(4), NodeId::random(), 2)
            .await
            .unwrap();
        let handler: Arc<dyn RequestHandler> = Arc::new(Echo);
        b.set_request_handler(Arc::downgrade(&handler));

        b.set_suspended(true);
        let short = RpcOptions::new(Duration::from_millis(200));
        let addr = b.local_contact().addr;
        assert_eq!(
            a.find_node(&b.local_contact(), NodeId::ZERO, short).await.err(),
            Some(RpcError::Timeout { addr })
        );
        // Outbound requests still work while suspended
        let handler_a: Arc<dyn RequestHandler> = Arc::new(Echo);
        a.set_request_handler(Arc::downgrade(&handler_a));
        assert!(b.ping(&a.local_contact(), options()).await.is_ok());

        b.set_suspended(false);
        assert!(a.ping(&b.local_contact(), options()).await.is_ok());
    }

    #[tokio::test]
    async fn test_tunnelled_request() {
        let registry = Arc::new(MuxRegistry::new());
        let seed = UdpDhtTransport::bind(registry, &local_config(5), NodeId::random(), 1)
            .await
            .unwrap();
        let handler: Arc<dyn RequestHandler> = Arc::new(Echo);
        seed.set_request_handler(Arc::downgrade(&handler));

        let requester = Contact::new(NodeId::random(), "192.0.2.7:4000".parse().unwrap());
        let packet = Packet {
            transaction_id: 9,
            protocol_version: PROTOCOL_VERSION,
            sender: requester.clone(),
            body: Body::Request(Request::Ping),
        };
        let datagram = seed.with_header(&packet.to_bytes().unwrap());
        let reply = seed
            .handle_tunnelled_request(&datagram, requester.addr)
            .unwrap();
        let reply = Packet::from_bytes(seed.strip_header(&reply).unwrap()).unwrap();
        assert_eq!(reply.transaction_id, 9);
        assert_eq!(reply.body, Body::Reply(Reply::Pong));

        let mut wrong_network = datagram.clone();
        wrong_network[3] ^= 0xFF;
        assert!(
            seed.handle_tunnelled_request(&wrong_network, requester.addr)
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_reachability_from_alien_traffic() {
        let registry = Arc::new(MuxRegistry::new());
        let node = UdpDhtTransport::bind(registry, &local_config(6), NodeId::random(), 1)
            .await
            .unwrap();
        assert!(!node.is_reachable());

        for _ in 0..20 {
            for _ in 0..10 {
                node.counters.record_received(RequestKind::FindValue, true);
            }
            node.tick();
        }
        assert!(node.is_reachable());

        for _ in 0..40 {
            node.tick();
        }
        assert!(!node.is_reachable());
    }
}
