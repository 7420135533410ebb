//! Property-based tests for kadmesh
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

fn node_id() -> impl Strategy<Value = kadmesh_dht::NodeId> {
    any::<[u8; 32]>().prop_map(kadmesh_dht::NodeId::from_bytes)
}

// ============================================================================
// NodeId / XOR Metric Properties
// ============================================================================

mod node_id_properties {
    use super::*;
    use kadmesh_dht::NodeId;

    proptest! {
        /// XOR distance is symmetric and zero only to itself
        #[test]
        fn distance_symmetric(a in node_id(), b in node_id()) {
            prop_assert_eq!(a.distance(&b), b.distance(&a));
            prop_assert_eq!(a.distance(&a), NodeId::ZERO);
            if a != b {
                prop_assert_ne!(a.distance(&b), NodeId::ZERO);
            }
        }

        /// Unidirectionality: for a fixed point, distinct ids are at distinct distances
        #[test]
        fn distance_unique(x in node_id(), a in node_id(), b in node_id()) {
            prop_assume!(a != b);
            prop_assert_ne!(x.distance(&a), x.distance(&b));
        }

        /// Shared prefix length agrees with bitwise comparison
        #[test]
        fn common_prefix_matches_bits(a in node_id(), b in node_id()) {
            let shared = a.common_prefix_len(&b);
            for i in 0..shared.min(NodeId::BITS) {
                prop_assert_eq!(a.bit(i), b.bit(i));
            }
            if shared < NodeId::BITS {
                prop_assert_ne!(a.bit(shared), b.bit(shared));
            }
        }

        /// Ids generated inside a prefix keep it
        #[test]
        fn random_in_prefix_keeps_prefix(prefix in node_id(), depth in 0usize..=256) {
            let id = NodeId::random_in_prefix(&prefix, depth);
            prop_assert!(id.common_prefix_len(&prefix) >= depth);
        }

        /// Setting a bit is visible through `bit` and touches nothing else
        #[test]
        fn with_bit_sets_one_bit(id in node_id(), index in 0usize..256, value in any::<bool>()) {
            let changed = id.with_bit(index, value);
            prop_assert_eq!(changed.bit(index), value);
            let flipped = changed.distance(&id);
            prop_assert!(flipped == NodeId::ZERO || flipped.leading_zeros() == index);
        }
    }
}

// ============================================================================
// Routing Table Properties
// ============================================================================

mod routing_properties {
    use super::*;
    use kadmesh_dht::routing::{RoutingConfig, RoutingTable};
    use kadmesh_dht::{Contact, NodeId};
    use std::net::SocketAddr;

    fn table(local: NodeId, ids: &[NodeId]) -> RoutingTable {
        let config = RoutingConfig {
            k: 4,
            b: 2,
            ..RoutingConfig::default()
        };
        let mut table = RoutingTable::new(local, config);
        for (i, id) in ids.iter().enumerate() {
            let addr = SocketAddr::from(([10, 0, (i / 250) as u8, (i % 250) as u8 + 1], 6881));
            table.contact_seen(Contact::new(*id, addr), i % 3 != 0);
        }
        table
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Buckets never exceed K and hold only ids inside their prefix
        #[test]
        fn buckets_bounded(local in node_id(), ids in prop::collection::vec(node_id(), 0..200)) {
            let table = table(local, &ids);
            for bucket in table.buckets() {
                prop_assert!(bucket.contacts().len() <= 4);
                for entry in bucket.contacts() {
                    prop_assert!(bucket.covers(&entry.contact.id));
                    prop_assert_ne!(entry.contact.id, local);
                }
            }
        }

        /// Every id falls into exactly one bucket
        #[test]
        fn buckets_partition_id_space(
            local in node_id(),
            ids in prop::collection::vec(node_id(), 0..200),
            probes in prop::collection::vec(node_id(), 1..20),
        ) {
            let table = table(local, &ids);
            for probe in probes.iter().chain(std::iter::once(&local)) {
                let covering = table.buckets().iter().filter(|b| b.covers(probe)).count();
                prop_assert_eq!(covering, 1);
            }
        }

        /// An admitted contact is its own closest contact
        #[test]
        fn admitted_contact_is_closest_to_itself(
            local in node_id(),
            ids in prop::collection::vec(node_id(), 1..150),
        ) {
            let table = table(local, &ids);
            let admitted: Vec<NodeId> = table.entries().map(|e| e.contact.id).collect();
            for id in admitted {
                let closest = table.find_closest(&id, 1);
                prop_assert_eq!(closest.len(), 1);
                prop_assert_eq!(closest[0].id, id);
            }
        }

        /// Closest contacts come back sorted by distance
        #[test]
        fn find_closest_sorted(
            local in node_id(),
            target in node_id(),
            ids in prop::collection::vec(node_id(), 0..150),
            count in 1usize..30,
        ) {
            let table = table(local, &ids);
            let closest = table.find_closest(&target, count);
            prop_assert!(closest.len() <= count);
            prop_assert!(closest.len() <= table.len());
            for pair in closest.windows(2) {
                prop_assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
            }
        }
    }
}

// ============================================================================
// Bloom Filter Properties
// ============================================================================

mod bloom_properties {
    use super::*;
    use kadmesh_dht::bloom::{BloomFilter, FilterKind};

    proptest! {
        /// Every added key is reported present
        #[test]
        fn no_false_negatives(
            counting in any::<bool>(),
            keys in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..32), 1..100),
        ) {
            let kind = if counting { FilterKind::Counting } else { FilterKind::AddOnly };
            let mut filter = BloomFilter::new(kind, 1000).unwrap();
            for key in &keys {
                filter.add(key);
            }
            for key in &keys {
                prop_assert!(filter.contains(key));
            }
        }

        /// Removing from a counting filter keeps the remaining keys present
        #[test]
        fn counting_remove_keeps_others(
            keys in prop::collection::hash_set(prop::collection::vec(any::<u8>(), 1..16), 2..50),
        ) {
            let keys: Vec<Vec<u8>> = keys.into_iter().collect();
            let mut filter = BloomFilter::new(FilterKind::Counting, 2000).unwrap();
            for key in &keys {
                filter.add(key);
            }
            let (removed, kept) = keys.split_at(keys.len() / 2);
            for key in removed {
                filter.remove(key).unwrap();
            }
            for key in kept {
                prop_assert!(filter.contains(key));
            }
        }

        /// Serialized filters answer the same queries
        #[test]
        fn serialized_filter_equivalent(
            keys in prop::collection::vec(any::<u64>(), 0..100),
            probes in prop::collection::vec(any::<u64>(), 0..50),
        ) {
            let mut filter = BloomFilter::new(FilterKind::Counting, 500).unwrap();
            for key in &keys {
                filter.add(&key.to_be_bytes());
            }
            let restored = BloomFilter::from_bytes(&filter.to_bytes()).unwrap();
            for probe in keys.iter().chain(&probes) {
                prop_assert_eq!(
                    restored.contains(&probe.to_be_bytes()),
                    filter.contains(&probe.to_be_bytes())
                );
            }
        }

        /// Arbitrary bytes never panic the filter decoder
        #[test]
        fn filter_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = BloomFilter::from_bytes(&bytes);
        }
    }
}

// ============================================================================
// Wire Format Properties
// ============================================================================

mod wire_properties {
    use super::*;
    use kadmesh_dht::rpc::messages::Packet;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(512))]

        /// Arbitrary datagrams never panic the packet decoder
        #[test]
        fn packet_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..1500)) {
            let _ = Packet::from_bytes(&bytes);
        }

        /// Anything that decodes re-encodes to a decodable packet
        #[test]
        fn decoded_packets_reencode(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
            if let Ok(packet) = Packet::from_bytes(&bytes) {
                let encoded = packet.to_bytes().unwrap();
                prop_assert!(Packet::from_bytes(&encoded).is_ok());
            }
        }
    }
}
