//! Cache Module
//!
//! Memory-budgeted, transaction-aware caches that share one global quota.
//! Each cache is a resizable table of individually locked buckets; resizing
//! migrates one bucket at a time while readers and writers keep going.

mod bucket;
mod entry;
mod finding;
mod hash;
mod locker;
mod lru;
mod manager;
mod metadata;
mod stats;
mod store;
mod table;
mod transaction;

#[cfg(test)]
mod property_tests;

// Re-export public types
pub use bucket::{
    BanishOutcome, BanishRecord, Bucket, BucketState, Displaced, Flag, BANISH_SLOTS,
    BUCKET_SIZE_IN_BYTES, SLOTS_PER_BUCKET,
};
pub use entry::{charged_size, CacheEntry, SLOT_OVERHEAD};
pub use finding::{Finding, LookupOutcome};
pub use hash::BucketHash;
pub use locker::{BucketCell, BucketLocker, LockTimeout};
pub use lru::{EvictionPolicy, LeastRecentlyUsed};
pub use manager::{Manager, ManagerStats};
pub use metadata::Metadata;
pub use stats::{CacheStats, StatsRecorder};
pub use store::{Cache, CacheType};
pub use table::{Subtable, Table, MAX_LOG_SIZE, MIN_LOG_SIZE, TABLE_PADDING};
pub use transaction::{Transaction, TransactionManager};

// == Public Constants ==
/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 256;

/// Maximum allowed value size in bytes
pub const MAX_VALUE_SIZE: usize = 1024 * 1024; // 1 MB
