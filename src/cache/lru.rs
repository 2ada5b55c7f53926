//! LRU Module
//!
//! Bucket-local victim selection. Eviction never scans beyond the bucket
//! being written, so it is O(slots per bucket).

use std::fmt::Debug;

use super::entry::CacheEntry;

// == Eviction Policy ==
/// Chooses which occupied slot of a full bucket to give up.
pub trait EvictionPolicy: Debug + Send + Sync {
    /// Returns the index of the victim slot, or `None` if there are no slots.
    fn select_victim(&self, slots: &[CacheEntry]) -> Option<usize>;
}

// == Least Recently Used ==
/// Evicts the slot with the oldest validated access; ties go to the lowest
/// slot index.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastRecentlyUsed;

impl EvictionPolicy for LeastRecentlyUsed {
    fn select_victim(&self, slots: &[CacheEntry]) -> Option<usize> {
        slots
            .iter()
            .enumerate()
            .map(|(index, entry)| (entry.last_access, index))
            .min()
            .map(|(_, index)| index)
    }
}
