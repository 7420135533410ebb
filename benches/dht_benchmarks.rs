//! DHT benchmarks
//!
//! Routing table maintenance, bloom filter cells, packet coding and a
//! loopback put/get round.
//!
//! Run with: `cargo bench --bench dht_benchmarks`

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use kadmesh_dht::bloom::{BloomFilter, FilterKind};
use kadmesh_dht::contact::PROTOCOL_VERSION;
use kadmesh_dht::routing::{RoutingConfig, RoutingTable};
use kadmesh_dht::rpc::messages::{Body, Packet, Reply};
use kadmesh_dht::{Contact, NodeId, ReplicationControl};
use kadmesh_integration_tests::fixtures::LoopbackMesh;
use std::net::SocketAddr;

fn contact(i: usize) -> Contact {
    let addr = SocketAddr::from(([10, (i >> 16) as u8, (i >> 8) as u8, i as u8], 6881));
    Contact::new(NodeId::hash(&i.to_be_bytes()), addr)
}

/// Benchmark routing table inserts and closest-contact queries
fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");
    let local = NodeId::hash(b"local");

    for count in [100usize, 1000, 5000] {
        let contacts: Vec<Contact> = (0..count).map(contact).collect();
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("contact_seen", count), &contacts, |b, contacts| {
            b.iter(|| {
                let mut table = RoutingTable::new(local, RoutingConfig::default());
                for contact in contacts {
                    black_box(table.contact_seen(contact.clone(), true));
                }
                table
            });
        });

        let mut table = RoutingTable::new(local, RoutingConfig::default());
        for contact in &contacts {
            table.contact_seen(contact.clone(), true);
        }
        let target = NodeId::hash(b"target");
        group.bench_with_input(BenchmarkId::new("find_closest", count), &table, |b, table| {
            b.iter(|| black_box(table.find_closest(&target, 20)));
        });
    }

    group.finish();
}

/// Benchmark bloom filter cell updates
fn bench_bloom(c: &mut Criterion) {
    let mut group = c.benchmark_group("bloom");
    let keys: Vec<[u8; 8]> = (0u64..1000).map(u64::to_be_bytes).collect();

    for kind in [FilterKind::AddOnly, FilterKind::Counting] {
        group.bench_function(BenchmarkId::new("add_1000", format!("{kind:?}")), |b| {
            b.iter(|| {
                let mut filter = BloomFilter::new(kind, 10_000).unwrap();
                for key in &keys {
                    filter.add(key);
                }
                filter
            });
        });
    }

    let mut filter = BloomFilter::new(FilterKind::Counting, 10_000).unwrap();
    for key in &keys {
        filter.add(key);
    }
    group.bench_function("contains", |b| {
        b.iter(|| black_box(filter.contains(black_box(b"not-present"))));
    });

    group.finish();
}

/// Benchmark packet encoding and decoding
fn bench_packets(c: &mut Criterion) {
    let mut group = c.benchmark_group("packets");

    for count in [0usize, 5, 20] {
        let packet = Packet {
            transaction_id: 42,
            protocol_version: PROTOCOL_VERSION,
            sender: contact(0),
            body: Body::Reply(Reply::FindNode {
                contacts: (1..=count).map(contact).collect(),
                spoof_token: 7,
            }),
        };
        let bytes = packet.to_bytes().unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", count), &packet, |b, packet| {
            b.iter(|| black_box(packet.to_bytes().unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("decode", count), &bytes, |b, bytes| {
            b.iter(|| black_box(Packet::from_bytes(bytes).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark a put followed by a get over an in-process network
fn bench_loopback_put_get(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mesh = runtime.block_on(async {
        let mesh = LoopbackMesh::new(16).await;
        mesh.connect_all();
        mesh
    });

    let mut round = 0u64;
    c.bench_function("loopback_put_get", |b| {
        b.iter(|| {
            round += 1;
            let key = round.to_be_bytes();
            runtime.block_on(async {
                mesh.node(1)
                    .put(&key, b"value".to_vec(), 0, 1, ReplicationControl::DEFAULT, true)
                    .await
                    .unwrap();
                black_box(mesh.node(7).get(&key, 0, false).await.unwrap())
            })
        });
    });

    runtime.block_on(mesh.destroy());
}

criterion_group!(
    benches,
    bench_routing,
    bench_bloom,
    bench_packets,
    bench_loopback_put_get
);
criterion_main!(benches);
