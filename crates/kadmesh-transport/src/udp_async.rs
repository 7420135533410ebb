//! Tokio UDP socket implementing [`Transport`].

use crate::TransportConfig;
use crate::transport::{Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::UdpSocket;

/// Async UDP transport.
///
/// Cloning shares the underlying socket and counters.
#[derive(Clone)]
pub struct AsyncUdpTransport {
    socket: Arc<UdpSocket>,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

impl AsyncUdpTransport {
    /// Bind with the default [`TransportConfig`].
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the socket cannot be created
    /// or bound
    ///
    /// # Examples
    /// ```no_run
    /// use kadmesh_transport::udp_async::AsyncUdpTransport;
    /// use kadmesh_transport::transport::Transport;
    /// use std::net::SocketAddr;
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let addr: SocketAddr = "127.0.0.1:0".parse()?;
    /// let transport = AsyncUdpTransport::bind(addr).await?;
    /// println!("Listening on {}", transport.local_addr()?);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn bind<A: Into<SocketAddr>>(addr: A) -> TransportResult<Self> {
        Self::bind_with_config(addr.into(), &TransportConfig::default())
    }

    /// Bind with explicit socket buffer sizes.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the socket cannot be created
    /// or bound
    pub fn bind_with_config(addr: SocketAddr, config: &TransportConfig) -> TransportResult<Self> {
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let bind_err = |e: std::io::Error| TransportError::BindFailed(format!("{addr}: {e}"));

        let socket2 =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
                .map_err(bind_err)?;

        socket2
            .set_recv_buffer_size(config.recv_buffer_size)
            .map_err(bind_err)?;
        socket2
            .set_send_buffer_size(config.send_buffer_size)
            .map_err(bind_err)?;
        socket2.bind(&addr.into()).map_err(bind_err)?;
        socket2.set_nonblocking(true).map_err(bind_err)?;

        let std_socket: std::net::UdpSocket = socket2.into();
        let socket = UdpSocket::from_std(std_socket).map_err(bind_err)?;

        tracing::debug!("Bound UDP socket on {}", addr);
        Ok(Self::from_socket(socket))
    }

    /// Wrap an already-bound tokio socket.
    #[must_use]
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            closed: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        }
    }
}

#[async_trait]
impl Transport for AsyncUdpTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        match self.socket.send_to(buf, addr).await {
            Ok(sent) => {
                self.counters
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(sent)
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        match self.socket.recv_from(buf).await {
            Ok((size, addr)) => {
                self.counters
                    .bytes_received
                    .fetch_add(size as u64, Ordering::Relaxed);
                self.counters
                    .packets_received
                    .fetch_add(1, Ordering::Relaxed);
                Ok((size, addr))
            }
            Err(e) => {
                self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
            recv_errors: self.counters.recv_errors.load(Ordering::Relaxed),
        }
    }
}
