//! Multi-node loopback fixture
//!
//! Builds N DHT instances on one [`LoopbackNetwork`], with maintenance
//! timers off so tests drive every step themselves.
//!
//! # Example
//!
//! ```no_run
//! use kadmesh_integration_tests::fixtures::LoopbackMesh;
//!
//! # async fn example() {
//! let mesh = LoopbackMesh::new(8).await;
//! mesh.connect_all();
//! let result = mesh.node(0).get(b"key", 0, false).await;
//! mesh.destroy().await;
//! # }
//! ```

use kadmesh_dht::rpc::loopback::{LoopbackConfig, LoopbackNetwork};
use kadmesh_dht::{Dht, DhtConfig, DhtOptions, NodeId};
use std::sync::Arc;

/// N loopback DHT nodes
pub struct LoopbackMesh {
    /// Network the nodes share
    pub network: LoopbackNetwork,
    /// The nodes, in creation order
    pub nodes: Vec<Arc<Dht>>,
}

impl LoopbackMesh {
    /// `count` nodes with the default configuration
    pub async fn new(count: usize) -> Self {
        Self::with_config(count, DhtConfig::default()).await
    }

    /// `count` nodes sharing `config`
    pub async fn with_config(count: usize, config: DhtConfig) -> Self {
        let network = LoopbackNetwork::new(LoopbackConfig::default());
        let mut mesh = Self {
            network,
            nodes: Vec::with_capacity(count),
        };
        for _ in 0..count {
            mesh.add_node(config.clone()).await;
        }
        tracing::debug!("Loopback mesh of {} nodes ready", count);
        mesh
    }

    /// Add one more node to the network, not yet known to anyone
    pub async fn add_node(&mut self, config: DhtConfig) -> Arc<Dht> {
        let transport = self.network.create_transport(NodeId::random(), rand::random());
        let dht = Dht::with_transport(transport, DhtOptions::new(config).without_timers())
            .await
            .expect("loopback DHT");
        self.nodes.push(dht.clone());
        dht
    }

    /// Node `i`
    pub fn node(&self, i: usize) -> &Arc<Dht> {
        &self.nodes[i]
    }

    /// Make every node know every other node as alive
    pub fn connect_all(&self) {
        for a in &self.nodes {
            for b in &self.nodes {
                if a.local_contact().id != b.local_contact().id {
                    a.control().add_contact(b.local_contact(), true);
                }
            }
        }
    }

    /// Join every node through node 0, one after the other
    pub async fn bootstrap_through_first(&self) {
        let seed = self.nodes[0].local_contact().addr;
        for node in &self.nodes[1..] {
            node.bootstrap(&[seed]).await.expect("bootstrap");
        }
    }

    /// Take node `i` off the network without destroying it
    pub fn disconnect(&self, i: usize) {
        self.network.remove(&self.nodes[i].local_contact().addr);
    }

    /// Destroy every node
    pub async fn destroy(&self) {
        for node in &self.nodes {
            node.destroy().await;
        }
    }
}
