//! Datagram transport abstraction.
//!
//! The multiplexer in [`crate::mux`] only needs to send and receive whole
//! datagrams, so every backend it drives implements the small [`Transport`]
//! trait defined here. Tests substitute in-memory implementations.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Datagram exceeds what the transport can carry
    #[error("Datagram of {size} bytes exceeds limit of {limit}")]
    TooLarge {
        /// Attempted datagram size
        size: usize,
        /// Maximum accepted size
        limit: usize,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async datagram transport.
///
/// # Examples
///
/// ```no_run
/// use kadmesh_transport::transport::Transport;
/// use kadmesh_transport::udp_async::AsyncUdpTransport;
/// use std::net::SocketAddr;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: SocketAddr = "127.0.0.1:0".parse()?;
/// let transport = AsyncUdpTransport::bind(addr).await?;
///
/// transport.send_to(b"ping", "127.0.0.1:6881".parse()?).await?;
///
/// let mut buf = vec![0u8; 1500];
/// let (size, from) = transport.recv_from(&mut buf).await?;
/// println!("Received {} bytes from {}", size, from);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one datagram to `addr`, returning the number of bytes written.
    ///
    /// # Errors
    /// Returns `TransportError` if the send operation fails or the
    /// transport is closed
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Receive one datagram into `buf`.
    ///
    /// # Returns
    /// A tuple of (bytes_received, sender_address)
    ///
    /// # Errors
    /// Returns `TransportError` if the receive operation fails or the
    /// transport is closed
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// Local address this transport is bound to.
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Close the transport. Later sends and receives return
    /// `TransportError::Closed`.
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Socket-level counters.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Byte and packet counters.
///
/// Used both for whole sockets and for the per-network slices the
/// multiplexer hands out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors, including datagrams dropped as undeliverable
    pub recv_errors: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.packets_sent += 1;
    }

    /// Record a successful receive
    pub fn record_recv(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.packets_received += 1;
    }

    /// Record a send error
    pub fn record_send_error(&mut self) {
        self.send_errors += 1;
    }

    /// Record a receive error
    pub fn record_recv_error(&mut self) {
        self.recv_errors += 1;
    }

    /// Add another set of counters into this one
    pub fn merge(&mut self, other: &TransportStats) {
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.packets_sent += other.packets_sent;
        self.packets_received += other.packets_received;
        self.send_errors += other.send_errors;
        self.recv_errors += other.recv_errors;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_stats_record() {
        let mut stats = TransportStats::new();
        assert_eq!(stats.bytes_sent, 0);

        stats.record_send(100);
        stats.record_recv(200);
        stats.record_send_error();
        stats.record_recv_error();

        assert_eq!(stats.bytes_sent, 100);
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.bytes_received, 200);
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.send_errors, 1);
        assert_eq!(stats.recv_errors, 1);
    }

    #[test]
    fn test_transport_stats_merge() {
        let mut a = TransportStats::new();
        a.record_send(10);
        let mut b = TransportStats::new();
        b.record_send(5);
        b.record_recv(7);

        a.merge(&b);
        assert_eq!(a.bytes_sent, 15);
        assert_eq!(a.packets_sent, 2);
        assert_eq!(a.bytes_received, 7);
    }

    #[test]
    fn test_transport_error_display() {
        assert_eq!(TransportError::Closed.to_string(), "Transport is closed");

        let err = TransportError::BindFailed("in use".to_string());
        assert!(err.to_string().contains("Failed to bind"));

        let err = TransportError::TooLarge {
            size: 70_000,
            limit: 65_536,
        };
        assert!(err.to_string().contains("70000"));
    }

    #[test]
    fn test_transport_error_from_io() {
        let io_err = std::io::Error::other("test");
        let transport_err = TransportError::from(io_err);
        assert!(matches!(transport_err, TransportError::Io(_)));
    }
}
