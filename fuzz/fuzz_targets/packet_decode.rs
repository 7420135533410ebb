//! Fuzz target for DHT packet decoding
//!
//! Arbitrary datagrams must decode to `Ok` or `Err`, never panic.

#![no_main]

use kadmesh_dht::rpc::messages::Packet;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::from_bytes(data) {
        // Whatever decodes must encode again
        let encoded = packet.to_bytes().expect("decoded packet re-encodes");
        let _ = Packet::from_bytes(&encoded);
    }
});
