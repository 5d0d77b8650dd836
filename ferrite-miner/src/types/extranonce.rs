//! Extranonce types for diversifying the coinbase search space.
//!
//! The extranonce1 is assigned per connection (or fixed per solo-mining
//! process); the extranonce2 is chosen by the worker. Together they form one
//! contiguous byte run inside the coinbase scriptSig, so two workers with
//! different extranonce2 values can never produce colliding coinbase
//! transactions.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtranonceError {
    #[error("invalid extranonce2 size: {0} (must be 1-8 bytes)")]
    InvalidSize(u8),

    #[error("value {0} exceeds maximum for size {1} bytes")]
    ValueTooLarge(u64, u8),

    #[error("invalid range: min {0} >= max {1}")]
    InvalidRange(u64, u64),

    #[error("invalid extranonce hex: {0}")]
    InvalidHex(String),
}

/// Connection-scoped extranonce, an opaque byte string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Extranonce1(Vec<u8>);

impl Extranonce1 {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Derive a connection extranonce from a counter, fixed at 8 bytes.
    pub fn from_counter(counter: u64) -> Self {
        Self(counter.to_be_bytes().to_vec())
    }

    pub fn from_hex(s: &str) -> Result<Self, ExtranonceError> {
        hex::decode(s)
            .map(Self)
            .map_err(|_| ExtranonceError::InvalidHex(s.to_string()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Extranonce1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// A specific extranonce2 value with fixed serialized size.
///
/// Stored as a u64 but serialized little-endian to exactly `size` bytes,
/// the form in which it is embedded in the coinbase scriptSig and carried
/// over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extranonce2 {
    value: u64,
    size: u8,
}

impl Extranonce2 {
    pub fn new(value: u64, size: u8) -> Result<Self, ExtranonceError> {
        if size == 0 || size > 8 {
            return Err(ExtranonceError::InvalidSize(size));
        }

        let max = Self::max_for_size(size);
        if value > max {
            return Err(ExtranonceError::ValueTooLarge(value, size));
        }

        Ok(Self { value, size })
    }

    /// Parse the wire form: a hex string of exactly `size` bytes.
    pub fn from_hex(s: &str, size: u8) -> Result<Self, ExtranonceError> {
        let bytes = hex::decode(s).map_err(|_| ExtranonceError::InvalidHex(s.to_string()))?;
        if bytes.len() != size as usize {
            return Err(ExtranonceError::InvalidHex(s.to_string()));
        }

        let mut padded = [0u8; 8];
        padded[..bytes.len()].copy_from_slice(&bytes);
        Self::new(u64::from_le_bytes(padded), size)
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    /// Little-endian serialization at the declared size.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.value.to_le_bytes()[..self.size as usize].to_vec()
    }

    fn max_for_size(size: u8) -> u64 {
        if size >= 8 {
            u64::MAX
        } else {
            (1u64 << (size * 8)) - 1
        }
    }
}

impl fmt::Display for Extranonce2 {
    /// Hex of the serialized bytes, matching what travels on the wire.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

/// A half-open window of the extranonce2 space assigned to one worker.
///
/// Splitting the full range gives each search worker a disjoint slice, so
/// parallel workers cannot duplicate work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extranonce2Range {
    min: u64,
    max: u64,
    current: u64,
    size: u8,
}

impl Extranonce2Range {
    /// The full range for the given serialized size.
    pub fn new(size: u8) -> Result<Self, ExtranonceError> {
        if size == 0 || size > 8 {
            return Err(ExtranonceError::InvalidSize(size));
        }

        Ok(Self {
            min: 0,
            max: Extranonce2::max_for_size(size),
            current: 0,
            size,
        })
    }

    pub fn new_range(min: u64, max: u64, size: u8) -> Result<Self, ExtranonceError> {
        if size == 0 || size > 8 {
            return Err(ExtranonceError::InvalidSize(size));
        }
        if min >= max {
            return Err(ExtranonceError::InvalidRange(min, max));
        }
        let size_max = Extranonce2::max_for_size(size);
        if max > size_max {
            return Err(ExtranonceError::ValueTooLarge(max, size));
        }

        Ok(Self {
            min,
            max,
            current: min,
            size,
        })
    }

    pub fn current(&self) -> Extranonce2 {
        // min <= current <= max holds by construction, and max is validated
        // against the size.
        Extranonce2::new(self.current, self.size).expect("range invariant")
    }

    /// Advance to the next value, or `None` when the window is exhausted.
    pub fn next(&mut self) -> Option<Extranonce2> {
        if self.current >= self.max {
            return None;
        }
        self.current += 1;
        Some(self.current())
    }

    pub fn search_space(&self) -> u64 {
        self.max - self.min + 1
    }

    /// Split into `n` non-overlapping sub-ranges of near-equal size.
    ///
    /// Returns `None` when `n` is zero or larger than the range itself.
    pub fn split(&self, n: usize) -> Option<Vec<Extranonce2Range>> {
        if n == 0 {
            return None;
        }
        if n == 1 {
            return Some(vec![self.clone()]);
        }

        let total = self.search_space();
        if (total as usize) < n {
            return None;
        }

        let chunk = total / n as u64;
        let remainder = total % n as u64;

        let mut ranges = Vec::with_capacity(n);
        let mut start = self.min;
        for i in 0..n {
            let len = chunk + if (i as u64) < remainder { 1 } else { 0 };
            let end = start + len - 1;
            ranges.push(Self::new_range(start, end, self.size).expect("sub-range is valid"));
            start = end + 1;
        }

        Some(ranges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extranonce1_hex_roundtrip() {
        let en1 = Extranonce1::from_hex("1234567890abcdef").unwrap();
        assert_eq!(en1.len(), 8);
        assert_eq!(en1.to_string(), "1234567890abcdef");
    }

    #[test]
    fn extranonce1_from_counter_is_unique_per_counter() {
        let a = Extranonce1::from_counter(1);
        let b = Extranonce1::from_counter(2);
        assert_ne!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn extranonce2_size_validation() {
        assert!(matches!(
            Extranonce2::new(0, 0),
            Err(ExtranonceError::InvalidSize(0))
        ));
        assert!(matches!(
            Extranonce2::new(0, 9),
            Err(ExtranonceError::InvalidSize(9))
        ));
        assert!(matches!(
            Extranonce2::new(0x100, 1),
            Err(ExtranonceError::ValueTooLarge(0x100, 1))
        ));
    }

    #[test]
    fn extranonce2_bytes_are_little_endian() {
        let en2 = Extranonce2::new(0x1234, 4).unwrap();
        assert_eq!(en2.to_bytes(), vec![0x34, 0x12, 0, 0]);
        assert_eq!(en2.to_string(), "34120000");
    }

    #[test]
    fn extranonce2_hex_roundtrip() {
        let en2 = Extranonce2::from_hex("deadbeef", 4).unwrap();
        assert_eq!(en2.to_bytes(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(en2.to_string(), "deadbeef");
    }

    #[test]
    fn extranonce2_hex_rejects_wrong_width() {
        assert!(Extranonce2::from_hex("dead", 4).is_err());
        assert!(Extranonce2::from_hex("zzzz", 2).is_err());
    }

    #[test]
    fn range_iteration() {
        let mut range = Extranonce2Range::new_range(0, 2, 1).unwrap();
        assert_eq!(range.current().value(), 0);
        assert_eq!(range.next().unwrap().value(), 1);
        assert_eq!(range.next().unwrap().value(), 2);
        assert!(range.next().is_none());
    }

    #[test]
    fn split_covers_range_without_overlap() {
        let range = Extranonce2Range::new_range(0, 99, 1).unwrap();
        let parts = range.split(4).unwrap();

        assert_eq!(parts.len(), 4);
        for window in parts.windows(2) {
            assert_eq!(window[0].max + 1, window[1].min);
        }
        assert_eq!(parts[0].min, 0);
        assert_eq!(parts[3].max, 99);
        assert_eq!(parts.iter().map(|r| r.search_space()).sum::<u64>(), 100);
    }

    #[test]
    fn split_distributes_remainder() {
        let range = Extranonce2Range::new_range(0, 9, 1).unwrap();
        let parts = range.split(3).unwrap();
        let sizes: Vec<u64> = parts.iter().map(|r| r.search_space()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
    }

    #[test]
    fn split_rejects_degenerate_requests() {
        let range = Extranonce2Range::new_range(0, 2, 1).unwrap();
        assert!(range.split(0).is_none());
        assert!(range.split(10).is_none());
    }
}
