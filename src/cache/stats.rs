//! Cache Statistics Module
//!
//! Tracks cache performance metrics including hits, misses, and evictions.
//! Counters are updated lock-free from any thread; [`CacheStats`] is a
//! point-in-time snapshot for telemetry.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::store::CacheType;

// == Stats Recorder ==
/// Live counters owned by one cache.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    banished_misses: AtomicU64,
    insertions: AtomicU64,
    rejected_insertions: AtomicU64,
    evictions: AtomicU64,
    banishments: AtomicU64,
    entries: AtomicU64,
}

impl StatsRecorder {
    /// Creates a recorder with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A miss forced by an active banishment; also counted as a miss.
    pub fn record_banished_miss(&self) {
        self.banished_misses.fetch_add(1, Ordering::Relaxed);
        self.record_miss();
    }

    /// An entry was stored in a previously free slot.
    pub fn record_insertion(&self) {
        self.insertions.fetch_add(1, Ordering::Relaxed);
        self.entries.fetch_add(1, Ordering::Relaxed);
    }

    /// An entry overwrote the stored value for the same key.
    pub fn record_replacement(&self) {
        self.insertions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_insertion(&self) {
        self.rejected_insertions.fetch_add(1, Ordering::Relaxed);
    }

    /// An entry was dropped to make room or to free memory.
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.record_removal();
    }

    /// An entry left the cache.
    pub fn record_removal(&self) {
        let _ = self
            .entries
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn record_banishment(&self) {
        self.banishments.fetch_add(1, Ordering::Relaxed);
    }

    /// Current number of stored entries.
    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    /// Copies the counters into a snapshot.
    pub fn snapshot(&self, name: &str, cache_type: CacheType, usage: u64, log_size: u32) -> CacheStats {
        CacheStats {
            name: name.to_string(),
            cache_type,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            banished_misses: self.banished_misses.load(Ordering::Relaxed),
            insertions: self.insertions.load(Ordering::Relaxed),
            rejected_insertions: self.rejected_insertions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            banishments: self.banishments.load(Ordering::Relaxed),
            entries: self.entries(),
            usage,
            log_size,
        }
    }
}

// == Cache Stats ==
/// Snapshot of one cache's performance metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    /// Registered cache name
    pub name: String,
    /// Plain or transactional
    pub cache_type: CacheType,
    /// Number of lookups that returned a value
    pub hits: u64,
    /// Number of lookups that returned nothing, for any reason
    pub misses: u64,
    /// Misses caused by an active banishment
    pub banished_misses: u64,
    /// Number of stored values, including overwrites
    pub insertions: u64,
    /// Inserts refused for quota, lock timeout or banishment
    pub rejected_insertions: u64,
    /// Entries dropped to make room or to free memory
    pub evictions: u64,
    /// Banishments recorded by write transactions
    pub banishments: u64,
    /// Current number of entries in the cache
    pub entries: u64,
    /// Bytes charged to the cache
    pub usage: u64,
    /// Log size of the primary table
    pub log_size: u32,
}

impl CacheStats {
    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
