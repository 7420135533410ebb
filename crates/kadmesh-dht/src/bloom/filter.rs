//! Fixed-size bloom filters with add-only or counting cells

use std::fmt;

/// Hash probes per key
pub const HASH_COUNT: usize = 5;

const KIND_ADD_ONLY: u8 = 1;
const KIND_COUNTING: u8 = 2;
const HEADER_LEN: usize = 9;
const NIBBLE_MAX: u8 = 0x0F;

/// Cell layout of a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// One bit per cell; entries cannot be removed
    AddOnly,
    /// Four saturating bits per cell; supports removal
    Counting,
}

impl FilterKind {
    fn discriminant(self) -> u8 {
        match self {
            Self::AddOnly => KIND_ADD_ONLY,
            Self::Counting => KIND_COUNTING,
        }
    }

    fn from_discriminant(byte: u8) -> Result<Self, BloomError> {
        match byte {
            KIND_ADD_ONLY => Ok(Self::AddOnly),
            KIND_COUNTING => Ok(Self::Counting),
            other => Err(BloomError::UnknownKind(other)),
        }
    }

    fn storage_len(self, cells: usize) -> usize {
        match self {
            Self::AddOnly => cells.div_ceil(8),
            Self::Counting => cells.div_ceil(2),
        }
    }
}

/// Bloom filter errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BloomError {
    /// Removal attempted on an add-only filter
    #[error("Add-only filters do not support removal")]
    AddOnly,

    /// Serialized kind byte not recognized
    #[error("Unknown filter kind {0}")]
    UnknownKind(u8),

    /// Serialized form shorter than its header claims
    #[error("Serialized filter truncated")]
    Truncated,

    /// Filter with no cells
    #[error("Filter must have at least one cell")]
    ZeroSize,
}

/// A bloom filter over byte-string keys.
///
/// Keys are folded into a 32-bit digest and spread over [`HASH_COUNT`]
/// cells by fixed mixing functions. There are no false negatives; the
/// false-positive rate stays low up to [`BloomFilter::capacity`] entries and
/// degrades gracefully beyond it.
#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    kind: FilterKind,
    max_entries: u32,
    entry_count: u32,
    cells: Vec<u8>,
}

impl BloomFilter {
    /// Create an empty filter with `max_entries` cells
    ///
    /// # Errors
    ///
    /// Returns `BloomError::ZeroSize` if `max_entries` is zero
    pub fn new(kind: FilterKind, max_entries: u32) -> Result<Self, BloomError> {
        if max_entries == 0 {
            return Err(BloomError::ZeroSize);
        }
        Ok(Self {
            kind,
            max_entries,
            entry_count: 0,
            cells: vec![0u8; kind.storage_len(max_entries as usize)],
        })
    }

    /// Filter kind
    #[must_use]
    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    /// Number of cells
    #[must_use]
    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    /// Approximate number of distinct keys added
    #[must_use]
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    /// Entries the filter holds before false positives become noticeable
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.max_entries / 10
    }

    /// Add `key`; returns the smallest cell value before the increment.
    ///
    /// Zero means the key was not present, in which case the entry count
    /// grows by one.
    pub fn add(&mut self, key: &[u8]) -> u32 {
        let indexes = self.indexes(key);
        let before = self.min_cell(&indexes);
        for index in indexes {
            self.increment(index);
        }
        if before == 0 {
            self.entry_count = self.entry_count.saturating_add(1);
        }
        before
    }

    /// Remove `key`; returns the smallest cell value before the decrement.
    ///
    /// Keys that were never added are left alone and report 0.
    ///
    /// # Errors
    ///
    /// Returns `BloomError::AddOnly` on an add-only filter
    pub fn remove(&mut self, key: &[u8]) -> Result<u32, BloomError> {
        if self.kind == FilterKind::AddOnly {
            return Err(BloomError::AddOnly);
        }
        let indexes = self.indexes(key);
        let before = self.min_cell(&indexes);
        if before == 0 {
            return Ok(0);
        }
        for index in indexes {
            self.decrement(index);
        }
        if before == 1 {
            self.entry_count = self.entry_count.saturating_sub(1);
        }
        Ok(before)
    }

    /// Estimated number of times `key` was added
    #[must_use]
    pub fn count(&self, key: &[u8]) -> u32 {
        self.min_cell(&self.indexes(key))
    }

    /// Whether `key` may have been added
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.count(key) > 0
    }

    /// Reset every cell
    pub fn clear(&mut self) {
        self.cells.fill(0);
        self.entry_count = 0;
    }

    /// Serialize as `[kind][max_entries BE][entry_count BE][cells]`
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.cells.len());
        out.push(self.kind.discriminant());
        out.extend_from_slice(&self.max_entries.to_be_bytes());
        out.extend_from_slice(&self.entry_count.to_be_bytes());
        out.extend_from_slice(&self.cells);
        out
    }

    /// Deserialize a filter written by [`BloomFilter::to_bytes`]
    ///
    /// # Errors
    ///
    /// - `BloomError::Truncated` if the input is shorter than announced
    /// - `BloomError::UnknownKind` for an unrecognized kind byte
    /// - `BloomError::ZeroSize` for a zero cell count
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BloomError> {
        let header = bytes.get(..HEADER_LEN).ok_or(BloomError::Truncated)?;
        let kind = FilterKind::from_discriminant(header[0])?;
        let max_entries = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        let entry_count = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
        if max_entries == 0 {
            return Err(BloomError::ZeroSize);
        }

        let len = kind.storage_len(max_entries as usize);
        let cells = bytes
            .get(HEADER_LEN..HEADER_LEN + len)
            .ok_or(BloomError::Truncated)?
            .to_vec();
        Ok(Self {
            kind,
            max_entries,
            entry_count,
            cells,
        })
    }

    fn indexes(&self, key: &[u8]) -> [usize; HASH_COUNT] {
        let h = digest(key);
        let n = self.max_entries;
        [
            h % n,
            h.wrapping_mul(0x9E37_79B1).wrapping_add(0x7F4A_7C15) % n,
            h.wrapping_mul(0x85EB_CA6B).wrapping_add(0x1656_67B1) % n,
            h.wrapping_mul(0xC2B2_AE35).wrapping_add(0x27D4_EB2F) % n,
            h.wrapping_mul(h).wrapping_add(0x2545_F491) % n,
        ]
        .map(|i| i as usize)
    }

    fn min_cell(&self, indexes: &[usize; HASH_COUNT]) -> u32 {
        indexes
            .iter()
            .map(|&i| u32::from(self.cell(i)))
            .min()
            .unwrap_or(0)
    }

    fn cell(&self, index: usize) -> u8 {
        match self.kind {
            FilterKind::AddOnly => (self.cells[index / 8] >> (index % 8)) & 1,
            FilterKind::Counting => {
                let byte = self.cells[index / 2];
                if index % 2 == 0 {
                    byte & NIBBLE_MAX
                } else {
                    byte >> 4
                }
            }
        }
    }

    fn set_cell(&mut self, index: usize, value: u8) {
        match self.kind {
            FilterKind::AddOnly => {
                let mask = 1u8 << (index % 8);
                if value > 0 {
                    self.cells[index / 8] |= mask;
                } else {
                    self.cells[index / 8] &= !mask;
                }
            }
            FilterKind::Counting => {
                let byte = &mut self.cells[index / 2];
                if index % 2 == 0 {
                    *byte = (*byte & 0xF0) | (value & NIBBLE_MAX);
                } else {
                    *byte = (*byte & NIBBLE_MAX) | (value << 4);
                }
            }
        }
    }

    fn increment(&mut self, index: usize) {
        let max = match self.kind {
            FilterKind::AddOnly => 1,
            FilterKind::Counting => NIBBLE_MAX,
        };
        let value = self.cell(index);
        if value < max {
            self.set_cell(index, value + 1);
        }
    }

    fn decrement(&mut self, index: usize) {
        let value = self.cell(index);
        // Saturated cells have lost their count
        if value > 0 && value < NIBBLE_MAX {
            self.set_cell(index, value - 1);
        }
    }
}

impl fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BloomFilter")
            .field("kind", &self.kind)
            .field("max_entries", &self.max_entries)
            .field("entry_count", &self.entry_count)
            .finish()
    }
}

/// Fold `key` into the 32-bit digest the probes are derived from
fn digest(key: &[u8]) -> u32 {
    key.iter()
        .fold(0u32, |h, &b| h.wrapping_mul(191).wrapping_add(u32::from(b)))
}
