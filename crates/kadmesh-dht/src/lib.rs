//! # kadmesh DHT
//!
//! Embeddable Kademlia distributed hash table for peer-to-peer clients.
//!
//! This crate provides:
//! - A self-splitting routing table with replacement caches and liveness
//!   tracking
//! - Iterative FIND_NODE / FIND_VALUE lookups with alpha parallelism
//! - Quorum-based replication, original and cache republish, expiry
//! - Diversification of abused keys and signed key-blocks
//! - Rotating bloom filters for alien-traffic detection
//! - A UDP transport multiplexed by network id, an HTTP bootstrap tunnel
//!   and a deterministic loopback transport for tests
//! - NAT rendezvous publication and UDP hole punching
//! - A lifecycle-aware facade with listeners and a speed tester handle
//!
//! ## Example
//!
//! ```rust,no_run
//! use kadmesh_dht::{Dht, DhtConfig, DhtOptions, ReplicationControl};
//! use kadmesh_transport::MuxRegistry;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), kadmesh_dht::DhtError> {
//! let registry = Arc::new(MuxRegistry::new());
//! let config = DhtConfig {
//!     bootstrap: vec!["198.51.100.7:6881".parse().unwrap()],
//!     ..DhtConfig::default()
//! };
//! let dht = Dht::create(registry, DhtOptions::new(config)).await?;
//!
//! dht.put(b"swarm", b"peer".to_vec(), 0, 8, ReplicationControl::DEFAULT, false).await?;
//! let found = dht.get(b"swarm", 0, false).await?;
//! println!("{} values", found.values.len());
//!
//! dht.destroy().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bloom;
pub mod config;
pub mod contact;
pub mod control;
pub mod db;
pub mod error;
pub mod facade;
pub mod nat;
pub mod node_id;
pub mod routing;
pub mod rpc;
pub mod speed;

pub use config::{DhtConfig, TunnelConfig};
pub use contact::Contact;
pub use control::{ControlStats, DhtControl, GetResult, PutResult};
pub use db::diversify::{Diversification, DiversificationPolicy, DiversificationType, StorageAdapter};
pub use db::key_block::KeyBlock;
pub use db::storage::FileStorageAdapter;
pub use db::value::{ReplicationControl, StoredValue};
pub use error::{DhtError, Result};
pub use facade::{Dht, DhtEvent, DhtListener, DhtOptions, DhtState, DhtStats, ListenerId, RunStateSource};
pub use nat::{NatPuncher, PunchAdapter, PunchError, UdpHolePuncher};
pub use node_id::NodeId;
pub use rpc::{DhtTransport, Priority, RpcError};
pub use speed::SpeedTester;
