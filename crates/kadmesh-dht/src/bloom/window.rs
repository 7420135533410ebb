//! Two-filter sliding window for alien detection
//!
//! Every outbound send records the destination; an inbound packet whose
//! source is absent from the window is "alien" (we did not contact it
//! recently, so it found us on its own). The window keeps a current and a
//! next filter. Inserts go to both, lookups consult both, and each period
//! the current one is discarded and the next promoted, so a key stays
//! visible for between one and two periods.

use super::filter::{BloomError, BloomFilter, FilterKind};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct WindowFilters {
    current: BloomFilter,
    next: BloomFilter,
    rotated_at: Instant,
}

/// Rotating pair of add-only bloom filters
pub struct BloomWindow {
    filters: Mutex<WindowFilters>,
    period: Duration,
}

impl BloomWindow {
    /// Create a window of two `cells`-sized filters rotated every `period`
    ///
    /// # Errors
    ///
    /// Returns `BloomError::ZeroSize` if `cells` is zero
    pub fn new(cells: u32, period: Duration) -> Result<Self, BloomError> {
        Ok(Self {
            filters: Mutex::new(WindowFilters {
                current: BloomFilter::new(FilterKind::AddOnly, cells)?,
                next: BloomFilter::new(FilterKind::AddOnly, cells)?,
                rotated_at: Instant::now(),
            }),
            period,
        })
    }

    fn with_filters<T>(&self, f: impl FnOnce(&mut WindowFilters) -> T) -> T {
        let mut filters = self.filters.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = filters.rotated_at.elapsed();
        if elapsed >= self.period * 2 {
            filters.current.clear();
            filters.next.clear();
            filters.rotated_at = Instant::now();
        } else if elapsed >= self.period {
            rotate_filters(&mut filters);
        }
        f(&mut filters)
    }

    /// Record `key` as recently contacted
    pub fn update(&self, key: &[u8]) {
        self.with_filters(|filters| {
            filters.current.add(key);
            filters.next.add(key);
        });
    }

    /// Whether `key` is in the window
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.with_filters(|filters| filters.current.contains(key) || filters.next.contains(key))
    }

    /// Returns true if `key` was not in the window, then records it
    pub fn check_and_record(&self, key: &[u8]) -> bool {
        self.with_filters(|filters| {
            let alien = !filters.current.contains(key) && !filters.next.contains(key);
            if alien {
                filters.current.add(key);
                filters.next.add(key);
            }
            alien
        })
    }

    /// Rotate immediately
    pub fn rotate(&self) {
        let mut filters = self.filters.lock().unwrap_or_else(|e| e.into_inner());
        rotate_filters(&mut filters);
    }

    /// Record an outbound destination
    pub fn update_address(&self, addr: &SocketAddr) {
        self.update(&address_key(addr));
    }

    /// Alien check for an inbound source
    pub fn check_address(&self, addr: &SocketAddr) -> bool {
        self.check_and_record(&address_key(addr))
    }
}

impl std::fmt::Debug for BloomWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomWindow")
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

fn rotate_filters(filters: &mut WindowFilters) {
    filters.current.clear();
    std::mem::swap(&mut filters.current, &mut filters.next);
    filters.rotated_at = Instant::now();
}

/// Window key for an address. Only the IP counts, since NATs remap ports.
#[must_use]
pub fn address_key(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => v4.ip().octets().to_vec(),
        SocketAddr::V6(v6) => v6.ip().octets().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alien_then_known() {
        let window = BloomWindow::new(1000, Duration::from_secs(600)).unwrap();
        let addr: SocketAddr = "198.51.100.7:6881".parse().unwrap();
        assert!(window.check_address(&addr));
        assert!(!window.check_address(&addr));
    }

    #[test]
    fn test_outbound_contact_not_alien() {
        let window = BloomWindow::new(1000, Duration::from_secs(600)).unwrap();
        let addr: SocketAddr = "198.51.100.7:6881".parse().unwrap();
        window.update_address(&addr);
        // Port differs, IP matches
        let reply_from: SocketAddr = "198.51.100.7:7000".parse().unwrap();
        assert!(!window.check_address(&reply_from));
    }

    #[test]
    fn test_rotation_ages_out_keys() {
        let window = BloomWindow::new(1000, Duration::from_secs(600)).unwrap();
        window.update(b"peer");
        window.rotate();
        assert!(window.contains(b"peer"));
        window.rotate();
        assert!(!window.contains(b"peer"));
    }

    #[test]
    fn test_lazy_rotation_after_period() {
        let window = BloomWindow::new(1000, Duration::from_millis(10)).unwrap();
        window.update(b"peer");
        std::thread::sleep(Duration::from_millis(30));
        assert!(!window.contains(b"peer"));
    }

    proptest::proptest! {
        #[test]
        fn prop_recorded_keys_survive_one_rotation(
            keys in proptest::collection::vec(proptest::collection::vec(proptest::num::u8::ANY, 1..16), 1..40),
        ) {
            let window = BloomWindow::new(4000, Duration::from_secs(600)).unwrap();
            for key in &keys {
                window.update(key);
            }
            window.rotate();
            for key in &keys {
                proptest::prop_assert!(window.contains(key));
                proptest::prop_assert!(!window.check_and_record(key));
            }
        }
    }
}
