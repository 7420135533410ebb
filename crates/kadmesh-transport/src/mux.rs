//! Per-port packet multiplexer.
//!
//! Several logical DHT networks can share one bound UDP port. Every datagram
//! starts with a 4-byte big-endian network id; a [`PortDispatcher`] strips
//! it and hands the remainder to the [`PacketHandler`] registered for that
//! network. The [`MuxRegistry`] owns one dispatcher per bound port and is
//! passed explicitly to whoever needs it, so independent registries (and
//! thus independent DHT instances) can coexist in one process.

use crate::TransportConfig;
use crate::transport::{Transport, TransportError, TransportStats};
use crate::udp_async::AsyncUdpTransport;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Logical network identifier carried on every datagram
pub type NetworkId = u32;

/// Length of the network id header
pub const NETWORK_HEADER_LEN: usize = 4;

/// Multiplexer errors
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// No handler is registered for the network on this port
    #[error("Network {network} not registered on port {port}")]
    NetworkNotRegistered {
        /// Local port
        port: u16,
        /// Network id found in the datagram
        network: NetworkId,
    },

    /// A handler for the network is already registered on this port
    #[error("Network {network} already registered on port {port}")]
    AlreadyRegistered {
        /// Local port
        port: u16,
        /// Network id
        network: NetworkId,
    },

    /// Datagram shorter than the network header
    #[error("Datagram of {0} bytes is too short for a network header")]
    Truncated(usize),

    /// Underlying transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Receiver of the datagrams addressed to one network.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    /// Handle one datagram with the network header already removed.
    async fn handle_packet(&self, payload: Vec<u8>, from: SocketAddr);
}

#[derive(Default)]
struct NetworkCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
}

impl NetworkCounters {
    fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: 0,
        }
    }
}

struct Registration {
    handler: Arc<dyn PacketHandler>,
    counters: Arc<NetworkCounters>,
}

/// Demultiplexes one transport into many networks.
pub struct PortDispatcher {
    port: u16,
    transport: Arc<dyn Transport>,
    handlers: RwLock<HashMap<NetworkId, Registration>>,
    unregistered_drops: AtomicU64,
    max_datagram_size: usize,
    receive_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PortDispatcher {
    /// Create a dispatcher over a bound transport.
    ///
    /// The receive loop does not run until [`PortDispatcher::start`] is
    /// called; tests can feed datagrams through [`PortDispatcher::dispatch`]
    /// directly.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport's local address is unavailable
    pub fn new(
        transport: Arc<dyn Transport>,
        max_datagram_size: usize,
    ) -> Result<Self, MuxError> {
        let port = transport.local_addr()?.port();
        Ok(Self {
            port,
            transport,
            handlers: RwLock::new(HashMap::new()),
            unregistered_drops: AtomicU64::new(0),
            max_datagram_size,
            receive_task: std::sync::Mutex::new(None),
        })
    }

    /// Local port this dispatcher serves
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Register a handler for `network`.
    ///
    /// # Errors
    ///
    /// Returns `MuxError::AlreadyRegistered` if the network already has a
    /// handler on this port
    pub fn register(
        &self,
        network: NetworkId,
        handler: Arc<dyn PacketHandler>,
    ) -> Result<NetworkHandle, MuxError> {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.contains_key(&network) {
            return Err(MuxError::AlreadyRegistered {
                port: self.port,
                network,
            });
        }

        let counters = Arc::new(NetworkCounters::default());
        handlers.insert(
            network,
            Registration {
                handler,
                counters: Arc::clone(&counters),
            },
        );
        tracing::debug!("Registered network {} on port {}", network, self.port);

        Ok(NetworkHandle {
            network,
            port: self.port,
            transport: Arc::clone(&self.transport),
            counters,
        })
    }

    /// Remove the handler for `network`. Returns whether one was registered.
    pub fn unregister(&self, network: NetworkId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.remove(&network).is_some()
    }

    /// Number of registered networks
    #[must_use]
    pub fn network_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Datagrams dropped because their network had no handler
    #[must_use]
    pub fn unregistered_drops(&self) -> u64 {
        self.unregistered_drops.load(Ordering::Relaxed)
    }

    /// Route one raw datagram to its network's handler.
    ///
    /// The handler runs on its own task, so a slow handler never stalls the
    /// receive loop.
    ///
    /// # Errors
    ///
    /// - `MuxError::Truncated` if the datagram has no complete header
    /// - `MuxError::NetworkNotRegistered` if no handler owns the network
    pub fn dispatch(&self, datagram: &[u8], from: SocketAddr) -> Result<(), MuxError> {
        let network = read_network_id(datagram)?;

        let (handler, counters) = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            match handlers.get(&network) {
                Some(reg) => (Arc::clone(&reg.handler), Arc::clone(&reg.counters)),
                None => {
                    self.unregistered_drops.fetch_add(1, Ordering::Relaxed);
                    return Err(MuxError::NetworkNotRegistered {
                        port: self.port,
                        network,
                    });
                }
            }
        };

        counters
            .bytes_received
            .fetch_add(datagram.len() as u64, Ordering::Relaxed);
        counters.packets_received.fetch_add(1, Ordering::Relaxed);

        let payload = datagram[NETWORK_HEADER_LEN..].to_vec();
        tokio::spawn(async move {
            handler.handle_packet(payload, from).await;
        });
        Ok(())
    }

    /// Spawn the receive loop.
    pub fn start(self: &Arc<Self>) {
        let dispatcher = Arc::clone(self);
        let task = tokio::spawn(async move {
            dispatcher.receive_loop().await;
        });
        let mut slot = self.receive_task.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(task);
    }

    async fn receive_loop(&self) {
        let mut buf = vec![0u8; self.max_datagram_size];
        tracing::debug!("Receive loop started on port {}", self.port);

        loop {
            match self.transport.recv_from(&mut buf).await {
                Ok((size, from)) => {
                    if let Err(e) = self.dispatch(&buf[..size], from) {
                        tracing::debug!("Dropped datagram from {}: {}", from, e);
                    }
                }
                Err(TransportError::Closed) => break,
                Err(e) => {
                    // ICMP port-unreachable surfaces here on some platforms
                    tracing::trace!("Receive error on port {}: {}", self.port, e);
                }
            }
        }

        tracing::debug!("Receive loop stopped on port {}", self.port);
    }

    /// Stop the receive loop and close the transport.
    pub async fn shutdown(&self) {
        let task = self
            .receive_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        if let Err(e) = self.transport.close().await {
            tracing::warn!("Error closing transport on port {}: {}", self.port, e);
        }
    }
}

fn read_network_id(datagram: &[u8]) -> Result<NetworkId, MuxError> {
    let header: [u8; NETWORK_HEADER_LEN] = datagram
        .get(..NETWORK_HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or(MuxError::Truncated(datagram.len()))?;
    Ok(NetworkId::from_be_bytes(header))
}

/// Sending side of one network on a shared port.
#[derive(Clone)]
pub struct NetworkHandle {
    network: NetworkId,
    port: u16,
    transport: Arc<dyn Transport>,
    counters: Arc<NetworkCounters>,
}

impl NetworkHandle {
    /// Network id this handle writes
    #[must_use]
    pub fn network(&self) -> NetworkId {
        self.network
    }

    /// Local port shared by all networks of the dispatcher
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Local socket address
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot report its address
    pub fn local_addr(&self) -> Result<SocketAddr, MuxError> {
        Ok(self.transport.local_addr()?)
    }

    /// Send `payload` to `to`, prefixed with this handle's network id.
    ///
    /// # Errors
    ///
    /// Returns `MuxError::Transport` if the underlying send fails
    pub async fn send(&self, payload: &[u8], to: SocketAddr) -> Result<usize, MuxError> {
        let mut datagram = Vec::with_capacity(NETWORK_HEADER_LEN + payload.len());
        datagram.extend_from_slice(&self.network.to_be_bytes());
        datagram.extend_from_slice(payload);

        match self.transport.send_to(&datagram, to).await {
            Ok(sent) => {
                self.counters
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(sent)
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Counters for this network only
    #[must_use]
    pub fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }
}

impl std::fmt::Debug for NetworkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkHandle")
            .field("network", &self.network)
            .field("port", &self.port)
            .finish()
    }
}

/// Owner of all port dispatchers of one process or test.
#[derive(Default)]
pub struct MuxRegistry {
    dispatchers: Mutex<HashMap<u16, Arc<PortDispatcher>>>,
    config: TransportConfig,
}

impl MuxRegistry {
    /// Create an empty registry with default socket settings
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry with explicit socket settings
    #[must_use]
    pub fn with_config(config: TransportConfig) -> Self {
        Self {
            dispatchers: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Register `handler` for `network` on the port of `bind`.
    ///
    /// Binds a new UDP socket the first time a port is used; later
    /// registrations on the same port share it. Port 0 always binds a fresh
    /// ephemeral port.
    ///
    /// # Errors
    ///
    /// - `MuxError::Transport` if binding fails
    /// - `MuxError::AlreadyRegistered` if the network is taken on that port
    pub async fn register(
        &self,
        bind: SocketAddr,
        network: NetworkId,
        handler: Arc<dyn PacketHandler>,
    ) -> Result<NetworkHandle, MuxError> {
        let mut dispatchers = self.dispatchers.lock().await;

        if bind.port() != 0 {
            if let Some(dispatcher) = dispatchers.get(&bind.port()) {
                return dispatcher.register(network, handler);
            }
        }

        let transport = AsyncUdpTransport::bind_with_config(bind, &self.config)?;
        let dispatcher = Arc::new(PortDispatcher::new(
            Arc::new(transport),
            self.config.max_datagram_size,
        )?);
        dispatcher.start();

        let handle = dispatcher.register(network, handler)?;
        tracing::info!("Listening on UDP port {}", dispatcher.port());
        dispatchers.insert(dispatcher.port(), dispatcher);
        Ok(handle)
    }

    /// Remove a network; closes the port once its last network leaves.
    pub async fn unregister(&self, port: u16, network: NetworkId) {
        let mut dispatchers = self.dispatchers.lock().await;
        let Some(dispatcher) = dispatchers.get(&port).cloned() else {
            return;
        };

        dispatcher.unregister(network);
        if dispatcher.network_count() == 0 {
            dispatchers.remove(&port);
            dispatcher.shutdown().await;
            tracing::info!("Closed UDP port {}", port);
        }
    }

    /// Dispatcher serving `port`, if bound
    pub async fn dispatcher(&self, port: u16) -> Option<Arc<PortDispatcher>> {
        self.dispatchers.lock().await.get(&port).cloned()
    }

    /// Number of bound ports
    pub async fn port_count(&self) -> usize {
        self.dispatchers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>);

    #[async_trait]
    impl PacketHandler for Forward {
        async fn handle_packet(&self, payload: Vec<u8>, from: SocketAddr) {
            let _ = self.0.send((payload, from));
        }
    }

    fn forward() -> (Arc<Forward>, mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Forward(tx)), rx)
    }

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_read_network_id() {
        assert_eq!(read_network_id(&[0, 0, 0, 7, 1, 2]).unwrap(), 7);
        assert!(matches!(
            read_network_id(&[0, 1]),
            Err(MuxError::Truncated(2))
        ));
    }

    proptest::proptest! {
        #[test]
        fn prop_network_id_prefix(network: u32, payload in proptest::collection::vec(proptest::num::u8::ANY, 0..64)) {
            let mut datagram = network.to_be_bytes().to_vec();
            datagram.extend_from_slice(&payload);
            proptest::prop_assert_eq!(read_network_id(&datagram).unwrap(), network);
        }
    }

    #[tokio::test]
    async fn test_dispatch_unregistered_network() {
        let transport = AsyncUdpTransport::bind(local()).await.unwrap();
        let dispatcher = PortDispatcher::new(Arc::new(transport), 1500).unwrap();
        let (handler, _rx) = forward();
        dispatcher.register(1, handler).unwrap();

        let from = local();
        let err = dispatcher.dispatch(&[0, 0, 0, 2, 0xAA], from).unwrap_err();
        assert!(matches!(
            err,
            MuxError::NetworkNotRegistered { network: 2, .. }
        ));
        assert_eq!(dispatcher.unregistered_drops(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_strips_header() {
        let transport = AsyncUdpTransport::bind(local()).await.unwrap();
        let dispatcher = PortDispatcher::new(Arc::new(transport), 1500).unwrap();
        let (handler, mut rx) = forward();
        let handle = dispatcher.register(9, handler).unwrap();

        dispatcher
            .dispatch(&[0, 0, 0, 9, 1, 2, 3], "10.0.0.1:5000".parse().unwrap())
            .unwrap();

        let (payload, from) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, vec![1, 2, 3]);
        assert_eq!(from.port(), 5000);
        assert_eq!(handle.stats().packets_received, 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let transport = AsyncUdpTransport::bind(local()).await.unwrap();
        let dispatcher = PortDispatcher::new(Arc::new(transport), 1500).unwrap();
        let (a, _) = forward();
        let (b, _) = forward();
        dispatcher.register(3, a).unwrap();
        assert!(matches!(
            dispatcher.register(3, b),
            Err(MuxError::AlreadyRegistered { network: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_two_networks_share_port() {
        let registry = MuxRegistry::new();
        let (h0, mut rx0) = forward();
        let handle0 = registry.register(local(), 0, h0).await.unwrap();
        let port = handle0.port();

        let (h1, mut rx1) = forward();
        let bind: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let handle1 = registry.register(bind, 1, h1).await.unwrap();
        assert_eq!(handle1.port(), port);
        assert_eq!(registry.port_count().await, 1);

        let (sender_handler, _) = forward();
        let sender = registry.register(local(), 0, sender_handler).await.unwrap();
        let target = handle0.local_addr().unwrap();

        sender.send(b"net-zero", target).await.unwrap();
        let (payload, _) = tokio::time::timeout(Duration::from_secs(2), rx0.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, b"net-zero");
        assert!(rx1.try_recv().is_err());
        assert_eq!(sender.stats().packets_sent, 1);
    }

    #[tokio::test]
    async fn test_unregister_closes_port() {
        let registry = MuxRegistry::new();
        let (h, _) = forward();
        let handle = registry.register(local(), 5, h).await.unwrap();
        assert_eq!(registry.port_count().await, 1);

        registry.unregister(handle.port(), 5).await;
        assert_eq!(registry.port_count().await, 0);
        assert!(registry.dispatcher(handle.port()).await.is_none());
    }
}
