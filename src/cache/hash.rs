//! Bucket Hash Module
//!
//! 32-bit key digests. The top `log_size` bits of a digest select the bucket
//! in a table of that log size, so a bucket index at one size maps onto a
//! contiguous range of indices at a larger size (and back by shifting).

use std::fmt;
use std::sync::OnceLock;

use ahash::RandomState;

static HASHER: OnceLock<RandomState> = OnceLock::new();

fn hasher() -> &'static RandomState {
    // Fixed seeds: every cache and transaction must agree on a key's digest.
    HASHER.get_or_init(|| {
        RandomState::with_seeds(
            0x243f_6a88_85a3_08d3,
            0x1319_8a2e_0370_7344,
            0xa409_3822_299f_31d0,
            0x082e_fa98_ec4e_6c89,
        )
    })
}

// == Bucket Hash ==
/// A 32-bit digest of a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketHash(pub u32);

impl BucketHash {
    /// Digests a key.
    pub fn of(key: &[u8]) -> Self {
        let full = hasher().hash_one(key);
        Self((full >> 32) as u32 ^ full as u32)
    }

    /// Synthetic hash whose top `log_size` bits equal `index`.
    pub fn for_index(index: u64, log_size: u32) -> Self {
        debug_assert!(log_size > 0 && log_size <= 32);
        Self((index << (32 - log_size)) as u32)
    }

    /// Raw digest value.
    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }

    /// Bucket index in a table with `2^log_size` buckets.
    #[inline]
    pub fn index(self, log_size: u32) -> usize {
        debug_assert!(log_size > 0 && log_size <= 32);
        (u64::from(self.0) >> (32 - log_size)) as usize
    }
}

impl fmt::Display for BucketHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
