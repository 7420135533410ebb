//! # kadmesh Transport
//!
//! Datagram transport layer for the kadmesh DHT.
//!
//! This crate provides:
//! - The [`Transport`](transport::Transport) trait over raw datagram sockets
//! - A tokio UDP implementation with tuned socket buffers
//! - A per-port packet multiplexer that lets several logical DHT networks
//!   share one bound UDP port, keyed by a 4-byte network id
//!
//! ## Example
//!
//! ```rust,no_run
//! use kadmesh_transport::mux::{MuxRegistry, PacketHandler};
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl PacketHandler for Echo {
//!     async fn handle_packet(&self, payload: Vec<u8>, from: SocketAddr) {
//!         println!("{} bytes from {}", payload.len(), from);
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = MuxRegistry::new();
//! let handle = registry
//!     .register("127.0.0.1:0".parse()?, 0, Arc::new(Echo))
//!     .await?;
//! handle.send(b"hello", "127.0.0.1:6881".parse()?).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod mux;
pub mod transport;
pub mod udp_async;

pub use mux::{MuxError, MuxRegistry, NetworkHandle, NetworkId, PacketHandler, PortDispatcher};
pub use transport::{Transport, TransportError, TransportResult, TransportStats};
pub use udp_async::AsyncUdpTransport;

/// Socket configuration applied when the multiplexer binds a new port
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Receive buffer size in bytes
    pub recv_buffer_size: usize,
    /// Send buffer size in bytes
    pub send_buffer_size: usize,
    /// Largest datagram the receive loop accepts
    pub max_datagram_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 2 * 1024 * 1024,
            send_buffer_size: 2 * 1024 * 1024,
            max_datagram_size: 64 * 1024,
        }
    }
}
