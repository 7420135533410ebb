//! Rotating composition of bloom filters
//!
//! A rotator spreads a nominal capacity over `n` sub-filters. Every insert
//! lands in the current sub-filter and, as it fills, in a growing number of
//! its successors. Once the current one passes its share of the capacity it
//! is cleared and the next one, already warm with the recent keys, takes
//! over. Lookups only consult the current sub-filter.

use super::filter::{BloomError, BloomFilter, FilterKind};

/// Bloom filter with effectively unbounded capacity
#[derive(Debug, Clone)]
pub struct BloomRotator {
    filters: Vec<BloomFilter>,
    current: usize,
    rotations: u64,
}

impl BloomRotator {
    /// Create a rotator rated for `capacity` live keys over `n` sub-filters
    ///
    /// # Errors
    ///
    /// Returns `BloomError::ZeroSize` if `capacity` or `n` is zero
    pub fn new(kind: FilterKind, capacity: u32, n: usize) -> Result<Self, BloomError> {
        if n == 0 || capacity == 0 {
            return Err(BloomError::ZeroSize);
        }
        let cells = capacity
            .saturating_mul(10)
            .checked_div(n as u32)
            .filter(|c| *c > 0)
            .ok_or(BloomError::ZeroSize)?;
        let filters = (0..n)
            .map(|_| BloomFilter::new(kind, cells))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            filters,
            current: 0,
            rotations: 0,
        })
    }

    /// Sub-filter count
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Always false; a rotator has at least one sub-filter
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Rotations performed so far
    #[must_use]
    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    fn limit(&self) -> u32 {
        self.filters[self.current].capacity()
    }

    /// Add `key`; returns the current sub-filter's pre-increment count
    pub fn add(&mut self, key: &[u8]) -> u32 {
        let n = self.filters.len();
        let limit = self.limit();
        let chunk = limit / n as u32;
        let entries = self.filters[self.current].entry_count();
        let to_update = if chunk == 0 {
            n
        } else {
            n.min((entries / chunk) as usize + 1)
        };

        let mut result = 0;
        for offset in 0..to_update {
            let index = (self.current + offset) % n;
            let before = self.filters[index].add(key);
            if offset == 0 {
                result = before;
            }
        }

        if self.filters[self.current].entry_count() > limit {
            self.filters[self.current].clear();
            self.current = (self.current + 1) % n;
            self.rotations += 1;
            tracing::trace!("Bloom rotator advanced to sub-filter {}", self.current);
        }
        result
    }

    /// Remove `key` from every sub-filter; returns the current sub-filter's
    /// pre-decrement count
    ///
    /// # Errors
    ///
    /// Returns `BloomError::AddOnly` for add-only sub-filters
    pub fn remove(&mut self, key: &[u8]) -> Result<u32, BloomError> {
        let mut result = 0;
        for (index, filter) in self.filters.iter_mut().enumerate() {
            let before = filter.remove(key)?;
            if index == self.current {
                result = before;
            }
        }
        Ok(result)
    }

    /// Whether `key` may be present
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.filters[self.current].contains(key)
    }

    /// Estimated add count of `key`
    #[must_use]
    pub fn count(&self, key: &[u8]) -> u32 {
        self.filters[self.current].count(key)
    }

    /// Approximate distinct keys in the current sub-filter
    #[must_use]
    pub fn entry_count(&self) -> u32 {
        self.filters[self.current].entry_count()
    }
}
