//! Bloom filters for anti-abuse bookkeeping
//!
//! - [`BloomFilter`]: fixed-size filter with 1-bit or 4-bit counting cells
//! - [`BloomRotator`]: chain of filters that forgets old keys gradually
//! - [`BloomWindow`]: two-filter time window used for alien detection

pub mod filter;
pub mod rotator;
pub mod window;

pub use filter::{BloomError, BloomFilter, FilterKind, HASH_COUNT};
pub use rotator::BloomRotator;
pub use window::{BloomWindow, address_key};
