//! Fuzz target for serialized bloom filters, as carried in DHT replies

#![no_main]

use kadmesh_dht::bloom::BloomFilter;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(mut filter) = BloomFilter::from_bytes(data) {
        filter.add(data);
        assert!(filter.contains(data));
        let _ = filter.remove(data);
    }
});
