//! Integration tests for cross-crate interactions.
//!
//! Multi-node scenarios over the loopback transport, plus UDP tests that
//! exercise the port multiplexer from the transport crate through the DHT.

use kadmesh_dht::db::diversify::DiversificationType;
use kadmesh_dht::facade::ListenerError;
use kadmesh_dht::{
    DhtConfig, DhtError, DhtEvent, DhtListener, DhtOptions, DhtState, Dht, DiversificationPolicy,
    KeyBlock, NodeId, Priority, ReplicationControl, RunStateSource, StorageAdapter,
};
use kadmesh_integration_tests::fixtures::LoopbackMesh;
use kadmesh_transport::MuxRegistry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Put / Get
// ============================================================================

#[tokio::test]
async fn test_put_get_across_nodes() {
    let mesh = LoopbackMesh::new(12).await;
    mesh.bootstrap_through_first().await;
    assert!(mesh.node(11).control().contacts().len() >= 5);

    let put = mesh
        .node(3)
        .put(b"swarm", b"peer-3".to_vec(), 0, 8, ReplicationControl::DEFAULT, false)
        .await
        .expect("put");
    assert!(put.acks >= 1);
    assert!(!put.is_diversified());

    let got = mesh.node(9).get(b"swarm", 0, false).await.expect("get");
    assert_eq!(got.values.len(), 1);
    assert_eq!(got.values[0].payload, b"peer-3");
    assert_eq!(got.values[0].originator.id, mesh.node(3).local_contact().id);
    assert_eq!(got.key, NodeId::hash(b"swarm"));

    let local = mesh.node(3).get_local_value(b"swarm").expect("local value");
    assert_eq!(local.payload, b"peer-3");
    let held: usize = mesh.nodes.iter().map(|n| n.get_stored_values().len()).sum();
    assert!(held >= 1);

    mesh.destroy().await;
}

#[tokio::test]
async fn test_newest_value_per_originator_wins() {
    let mesh = LoopbackMesh::new(6).await;
    mesh.connect_all();

    for payload in [b"one".to_vec(), b"two".to_vec()] {
        mesh.node(1)
            .put(b"versioned", payload, 0, 1, ReplicationControl::new(5, 0), true)
            .await
            .expect("put");
    }
    mesh.node(2)
        .put(b"versioned", b"other".to_vec(), 0, 1, ReplicationControl::new(5, 0), true)
        .await
        .expect("put");

    let got = mesh.node(4).get(b"versioned", 0, true).await.expect("get");
    let payloads: Vec<&[u8]> = got.values.iter().map(|v| v.payload.as_slice()).collect();
    assert_eq!(payloads.len(), 2);
    assert!(payloads.contains(&b"two".as_slice()));
    assert!(payloads.contains(&b"other".as_slice()));

    let first = mesh.node(4).get(b"versioned", 1, true).await.expect("get");
    assert_eq!(first.values.len(), 1);

    mesh.destroy().await;
}

#[tokio::test]
async fn test_remove_withdraws_value() {
    let mesh = LoopbackMesh::new(6).await;
    mesh.connect_all();

    mesh.node(0)
        .put(b"gone", b"soon".to_vec(), 0, 1, ReplicationControl::new(5, 0), false)
        .await
        .expect("put");
    mesh.node(0).remove(b"gone", true).await.expect("remove");
    assert!(mesh.node(0).get_local_value(b"gone").is_none());

    let got = mesh.node(3).get(b"gone", 0, true).await.expect("get");
    assert!(got.values.is_empty());

    assert!(matches!(
        mesh.node(0).remove(b"gone", true).await,
        Err(DhtError::InvalidState(_))
    ));

    mesh.destroy().await;
}

// ============================================================================
// Replication quorum
// ============================================================================

#[tokio::test]
async fn test_quorum_three_of_eight() {
    let mesh = LoopbackMesh::new(9).await;
    mesh.connect_all();
    let putter = mesh.node(0);
    let three = ReplicationControl::new(3, 0);

    let ok = putter
        .put(b"quorum", b"v".to_vec(), 0, 1, three, true)
        .await
        .expect("quorum of 8 reachable");
    assert!(ok.acks >= 3);
    assert_eq!(ok.required, 3);

    for i in 3..9 {
        mesh.disconnect(i);
    }
    match putter.put(b"quorum-2", b"v".to_vec(), 0, 1, three, true).await {
        Err(DhtError::QuorumNotReached { acks, required }) => {
            assert!(acks < 3);
            assert_eq!(required, 3);
        }
        other => panic!("expected quorum failure, got {other:?}"),
    }

    mesh.destroy().await;
}

#[tokio::test]
async fn test_failure_injection() {
    let mesh = LoopbackMesh::new(4).await;
    mesh.connect_all();

    mesh.network.set_fail_percentage(100);
    let err = mesh
        .node(0)
        .put(b"k", b"v".to_vec(), 0, 1, ReplicationControl::DEFAULT, true)
        .await
        .unwrap_err();
    assert!(err.is_transient());
    let stats = mesh.node(0).stats().control.rpc.total();
    assert!(stats.failed > 0);
    assert_eq!(stats.succeeded, 0);

    mesh.network.set_fail_percentage(0);
    for i in 1..4 {
        mesh.node(0).control().add_contact(mesh.node(i).local_contact(), true);
    }
    mesh.node(0)
        .put(b"k", b"v".to_vec(), 0, 1, ReplicationControl::DEFAULT, true)
        .await
        .expect("put once failures stop");

    mesh.destroy().await;
}

// ============================================================================
// Diversification and key-blocks
// ============================================================================

#[tokio::test]
async fn test_frequency_diversification_persists() {
    let config = DhtConfig {
        diversification: DiversificationPolicy {
            max_sources: 2,
            window_secs: 2,
            ..DiversificationPolicy::default()
        },
        ..DhtConfig::default()
    };
    let mesh = LoopbackMesh::with_config(7, config).await;
    mesh.connect_all();
    let all_others = ReplicationControl::new(6, 0);
    let key = NodeId::hash(b"popular");

    let mut results = Vec::new();
    for i in 1..=3 {
        let payload = format!("from-{i}").into_bytes();
        let result = mesh
            .node(i)
            .put(b"popular", payload, 0, 1, all_others, true)
            .await
            .expect("put");
        results.push(result);
    }
    assert!(!results[0].is_diversified());
    let div = results[2].diversification.clone().expect("third source diversifies");
    assert_eq!(div.kind, DiversificationType::Frequency);
    assert!(div.put_keys.len() > 1);

    let holder = mesh.node(0).control().database().adapter().clone();
    assert!(holder.is_diversified(&key));

    tokio::time::sleep(Duration::from_millis(2100)).await;
    let late = mesh
        .node(4)
        .put(b"popular", b"late".to_vec(), 0, 1, all_others, true)
        .await
        .expect("put");
    assert!(late.is_diversified());
    assert!(holder.is_diversified(&key));

    let got = mesh.node(5).get(b"popular", 0, true).await.expect("get");
    assert!(got.diversification.is_some());
    assert!(!got.values.is_empty());
    assert!(got.values.iter().all(|v| v.key == key));

    mesh.destroy().await;
}

#[tokio::test]
async fn test_key_block_stops_puts_and_gets() {
    let authority = ed25519_dalek::SigningKey::from_bytes(&[42u8; 32]);
    let config = DhtConfig {
        key_block_authority: Some(hex::encode(authority.verifying_key().to_bytes())),
        ..DhtConfig::default()
    };
    let mesh = LoopbackMesh::with_config(6, config).await;
    mesh.connect_all();

    mesh.node(1)
        .put(b"banned", b"v".to_vec(), 0, 1, ReplicationControl::new(5, 0), true)
        .await
        .expect("put before block");

    let created = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let block = KeyBlock::sign(NodeId::hash(b"banned"), created, &authority);
    let accepted = mesh.node(0).publish_key_block(block).await.expect("publish");
    assert!(accepted >= 4);

    let err = mesh.node(3).get(b"banned", 0, false).await.unwrap_err();
    assert!(err.is_key_blocked());
    let err = mesh
        .node(2)
        .put(b"banned", b"again".to_vec(), 0, 1, ReplicationControl::DEFAULT, true)
        .await
        .unwrap_err();
    assert!(err.is_key_blocked());

    let forged = KeyBlock::sign(
        NodeId::hash(b"other"),
        created,
        &ed25519_dalek::SigningKey::from_bytes(&[1u8; 32]),
    );
    assert!(matches!(
        mesh.node(0).publish_key_block(forged).await,
        Err(DhtError::KeyBlock(_))
    ));

    mesh.destroy().await;
}

#[tokio::test]
async fn test_block_from_another_authority_is_ignored() {
    let authority = ed25519_dalek::SigningKey::from_bytes(&[42u8; 32]);
    let honest = DhtConfig {
        key_block_authority: Some(hex::encode(authority.verifying_key().to_bytes())),
        ..DhtConfig::default()
    };
    let mut mesh = LoopbackMesh::with_config(5, honest).await;

    let rogue_authority = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
    let rogue = mesh
        .add_node(DhtConfig {
            key_block_authority: Some(hex::encode(rogue_authority.verifying_key().to_bytes())),
            ..DhtConfig::default()
        })
        .await;
    mesh.connect_all();

    let key = NodeId::hash(b"victim");
    let created = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let block = KeyBlock::sign(key, created, &rogue_authority);
    let accepted = rogue.publish_key_block(block).await.expect("rogue applies its own block");
    assert_eq!(accepted, 0);
    assert!(rogue.control().database().key_block(&key).is_some());

    mesh.node(0)
        .put(b"victim", b"v".to_vec(), 0, 1, ReplicationControl::new(3, 0), true)
        .await
        .expect("put ignores the unverifiable block");
    let got = mesh.node(1).get(b"victim", 0, true).await.expect("get ignores the block");
    assert_eq!(got.values.len(), 1);
    for i in 0..5 {
        assert!(mesh.node(i).control().database().key_block(&key).is_none());
    }

    mesh.destroy().await;
}

#[tokio::test]
async fn test_remote_blocks_need_local_authority() {
    let authority = ed25519_dalek::SigningKey::from_bytes(&[42u8; 32]);
    let mut mesh = LoopbackMesh::new(4).await;
    let signer = mesh
        .add_node(DhtConfig {
            key_block_authority: Some(hex::encode(authority.verifying_key().to_bytes())),
            ..DhtConfig::default()
        })
        .await;
    mesh.connect_all();

    let created = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    signer
        .publish_key_block(KeyBlock::sign(NodeId::hash(b"open"), created, &authority))
        .await
        .expect("publish");
    mesh.node(0)
        .put(b"open", b"v".to_vec(), 0, 1, ReplicationControl::new(2, 0), true)
        .await
        .expect("nodes without an authority never honour blocks");

    mesh.destroy().await;
}

#[tokio::test]
async fn test_oversized_value_rejected_before_sending() {
    let mesh = LoopbackMesh::new(3).await;
    mesh.connect_all();
    let max = kadmesh_dht::db::value::MAX_VALUE_SIZE;

    let err = mesh
        .node(0)
        .put(b"huge", vec![0u8; max + 1], 0, 1, ReplicationControl::DEFAULT, true)
        .await
        .unwrap_err();
    assert!(matches!(err, DhtError::ValueTooLarge { size, max: limit } if size == max + 1 && limit == max));
    assert!(!err.is_transient());
    assert_eq!(mesh.node(0).stats().control.rpc.total().sent, 0);
    assert!(mesh.node(0).get_local_value(b"huge").is_none());

    mesh.destroy().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_suspend_silences_node_and_resume_republishes() {
    let mut mesh = LoopbackMesh::new(5).await;
    mesh.connect_all();
    let owner = mesh.node(0).clone();
    owner
        .put(b"owned", b"mine".to_vec(), 0, 1, ReplicationControl::new(4, 0), true)
        .await
        .expect("put");

    owner.set_suspended(true);
    assert_eq!(owner.state(), DhtState::Suspended);
    let asker = mesh.node(1).control().clone();
    assert!(asker.ping(&owner.local_contact(), Priority::High).await.is_err());

    let late = mesh.add_node(DhtConfig::default()).await;
    mesh.connect_all();
    assert!(late.control().database().stored_values().is_empty());

    owner.set_suspended(false);
    assert!(asker.ping(&owner.local_contact(), Priority::High).await.is_ok());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while late.control().database().stored_values().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "resume did not republish");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(late.control().database().stored_values()[0].payload, b"mine");

    mesh.destroy().await;
}

#[derive(Default)]
struct Announcements {
    available: Mutex<Vec<u64>>,
}

impl DhtListener for Announcements {
    fn on_event(&self, event: &DhtEvent) -> Result<(), ListenerError> {
        if let DhtEvent::SpeedTesterAvailable(tester) = event {
            self.available.lock().unwrap().push(tester.id());
        }
        Ok(())
    }
}

#[derive(Default)]
struct HostState(AtomicBool);

impl RunStateSource for HostState {
    fn is_sleeping(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn test_sleep_suppresses_speed_tester_until_wake() {
    let mut mesh = LoopbackMesh::new(3).await;
    let host = Arc::new(HostState::default());
    let transport = mesh.network.create_transport(NodeId::random(), 7);
    let dht = Dht::with_transport(
        transport,
        DhtOptions::new(DhtConfig::default())
            .with_run_state(host.clone())
            .without_timers(),
    )
    .await
    .unwrap();
    mesh.nodes.push(dht.clone());
    mesh.connect_all();

    let first = Arc::new(Announcements::default());
    let second = Arc::new(Announcements::default());
    dht.add_listener(first.clone());
    dht.add_listener(second.clone());
    let original = dht.speed_tester().unwrap();
    assert_eq!(*first.available.lock().unwrap(), [original.id()]);

    host.0.store(true, Ordering::SeqCst);
    dht.run_state_changed();
    assert!(original.is_destroyed());
    assert!(dht.speed_tester().is_none());
    dht.run_state_changed();
    dht.set_suspended(true);
    dht.set_suspended(false);
    assert_eq!(first.available.lock().unwrap().len(), 1);

    host.0.store(false, Ordering::SeqCst);
    dht.run_state_changed();
    dht.run_state_changed();
    let fresh = dht.speed_tester().unwrap();
    for listener in [&first, &second] {
        assert_eq!(*listener.available.lock().unwrap(), [original.id(), fresh.id()]);
    }
    assert_eq!(dht.state(), DhtState::Active);

    let candidates = fresh.candidates(10);
    assert_eq!(candidates.len(), 3);
    assert!(fresh.probe(&candidates[0]).await.is_ok());

    mesh.destroy().await;
    assert!(fresh.is_destroyed());
}

#[tokio::test]
async fn test_sleeping_node_refuses_stores() {
    let mesh = LoopbackMesh::new(3).await;
    mesh.connect_all();
    let host = mesh.node(1).control();
    host.set_sleeping(true);
    mesh.node(2).control().set_sleeping(true);

    let err = mesh
        .node(0)
        .put(b"k", b"v".to_vec(), 0, 1, ReplicationControl::DEFAULT, true)
        .await
        .unwrap_err();
    assert!(matches!(err, DhtError::QuorumNotReached { acks: 0, .. }));
    assert!(host.database().stored_values().is_empty());

    mesh.destroy().await;
}

// ============================================================================
// State export / import
// ============================================================================

#[tokio::test]
async fn test_export_import_restores_routing() {
    let mut mesh = LoopbackMesh::new(6).await;
    mesh.connect_all();
    mesh.node(2)
        .put(b"persisted", b"v".to_vec(), 0, 1, ReplicationControl::new(5, 0), true)
        .await
        .expect("put");

    let mut state = Vec::new();
    let written = mesh.node(0).export_state(&mut state, 0).unwrap();
    assert_eq!(written, 5);

    let fresh = mesh.add_node(DhtConfig::default()).await;
    assert_eq!(fresh.import_state(&mut state.as_slice()).unwrap(), 5);
    let restored = fresh.control().contacts();
    for i in 1..6 {
        let id = mesh.node(i).local_contact().id;
        assert!(restored.iter().any(|c| c.id == id));
    }

    fresh.bootstrap(&[]).await.unwrap();
    let got = fresh.get(b"persisted", 0, false).await.expect("get");
    assert_eq!(got.values.len(), 1);

    assert!(matches!(
        fresh.import_state(&mut &b"nope"[..]),
        Err(DhtError::State(_))
    ));

    mesh.destroy().await;
}

// ============================================================================
// UDP multiplexing
// ============================================================================

async fn udp_node(registry: &Arc<MuxRegistry>, network: u32, bind: SocketAddr) -> Arc<Dht> {
    let config = DhtConfig {
        network,
        bind_addr: bind,
        rpc_timeout_ms: 300,
        ..DhtConfig::default()
    };
    Dht::create(registry.clone(), DhtOptions::new(config).without_timers())
        .await
        .expect("udp DHT")
}

#[tokio::test]
async fn test_two_networks_share_one_udp_port() {
    let registry = Arc::new(MuxRegistry::new());
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();

    let a = udp_node(&registry, 1, any).await;
    let shared = a.local_contact().addr;
    let b = udp_node(&registry, 2, shared).await;
    assert_eq!(b.local_contact().addr, shared);

    let c = udp_node(&registry, 1, any).await;
    let other = c.local_contact().addr;
    assert_ne!(other.port(), shared.port());

    // Network 1 on both ports
    let reply = a.control().ping(&c.local_contact(), Priority::High).await.unwrap();
    assert_eq!(reply.id, c.local_contact().id);

    // Network 2 is not registered on the second port: dropped
    let err = b.control().ping(&c.local_contact(), Priority::High).await.unwrap_err();
    assert!(err.is_transient());

    let d = udp_node(&registry, 2, other).await;
    let reply = b.control().ping(&d.local_contact(), Priority::High).await.unwrap();
    assert_eq!(reply.id, d.local_contact().id);

    // Same port, different network: answered by network 1's node
    let reply = a.control().ping(&d.local_contact(), Priority::High).await.unwrap();
    assert_eq!(reply.id, c.local_contact().id);

    for node in [&a, &b, &c, &d] {
        node.destroy().await;
    }
}

#[tokio::test]
async fn test_udp_put_get() {
    let registry = Arc::new(MuxRegistry::new());
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let mut nodes = Vec::new();
    for _ in 0..4 {
        nodes.push(udp_node(&registry, 9, any).await);
    }
    let seed = nodes[0].local_contact().addr;
    for node in &nodes[1..] {
        node.bootstrap(&[seed]).await.unwrap();
    }

    nodes[1]
        .put(b"udp", b"datagram".to_vec(), 0, 1, ReplicationControl::DEFAULT, true)
        .await
        .expect("put");
    let got = nodes[3].get(b"udp", 0, false).await.expect("get");
    assert_eq!(got.values.len(), 1);
    assert_eq!(got.values[0].payload, b"datagram");

    let stats = nodes[3].stats();
    assert!(stats.control.rpc.total().succeeded > 0);
    assert!(stats.control.contacts >= 1);

    for node in &nodes {
        node.destroy().await;
    }
}
