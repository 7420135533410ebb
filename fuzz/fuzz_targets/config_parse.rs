//! Fuzz test for configuration file parsing
//!
//! Arbitrary TOML must not panic the parser or the validator.

#![no_main]

use kadmesh_dht::DhtConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = toml::from_str::<DhtConfig>(s) {
            let _ = config.validate();
        }
    }
});
