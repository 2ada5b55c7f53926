//! Cache Entry Module
//!
//! Defines the contents of one bucket slot.

use bytes::Bytes;

use super::hash::BucketHash;

/// Nominal bookkeeping bytes charged per stored entry on top of its payload.
pub const SLOT_OVERHEAD: u64 = 48;

// == Cache Entry ==
/// A key/value pair stored in a bucket slot.
///
/// Keys and values are opaque byte payloads; cloning an entry only bumps
/// reference counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Digest of `key`
    pub hash: BucketHash,
    /// The key bytes
    pub key: Bytes,
    /// The cached payload
    pub value: Bytes,
    /// Logical clock tick of the last insert or validated hit
    pub last_access: u64,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates a new entry stamped with the given logical tick.
    pub fn new(key: Bytes, value: Bytes, tick: u64) -> Self {
        Self {
            hash: BucketHash::of(&key),
            key,
            value,
            last_access: tick,
        }
    }

    /// Creates an entry with a precomputed digest.
    pub fn with_hash(hash: BucketHash, key: Bytes, value: Bytes, tick: u64) -> Self {
        Self {
            hash,
            key,
            value,
            last_access: tick,
        }
    }

    // == Matching ==
    /// True if this entry stores `key`.
    #[inline]
    pub fn matches(&self, hash: BucketHash, key: &[u8]) -> bool {
        self.hash == hash && self.key.as_ref() == key
    }

    // == Touch ==
    /// Records a validated access at `tick`.
    #[inline]
    pub fn touch(&mut self, tick: u64) {
        if tick > self.last_access {
            self.last_access = tick;
        }
    }

    // == Size ==
    /// Bytes charged against the owning cache's usage.
    #[inline]
    pub fn size(&self) -> u64 {
        charged_size(self.key.len(), self.value.len())
    }
}

/// Bytes charged for an entry with the given key and value lengths.
#[inline]
pub fn charged_size(key_len: usize, value_len: usize) -> u64 {
    SLOT_OVERHEAD + key_len as u64 + value_len as u64
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_creation() {
        let entry = CacheEntry::new(Bytes::from_static(b"k"), Bytes::from_static(b"value"), 7);

        assert_eq!(entry.hash, BucketHash::of(b"k"));
        assert_eq!(entry.last_access, 7);
        assert_eq!(entry.size(), SLOT_OVERHEAD + 1 + 5);
    }

    #[test]
    fn test_entry_matches() {
        let entry = CacheEntry::new(Bytes::from_static(b"k"), Bytes::from_static(b"v"), 0);

        assert!(entry.matches(BucketHash::of(b"k"), b"k"));
        assert!(!entry.matches(BucketHash::of(b"k"), b"other"));
        assert!(!entry.matches(BucketHash(entry.hash.0 ^ 1), b"k"));
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut entry = CacheEntry::new(Bytes::from_static(b"k"), Bytes::from_static(b"v"), 5);

        entry.touch(9);
        assert_eq!(entry.last_access, 9);

        entry.touch(3);
        assert_eq!(entry.last_access, 9);
    }
}
