//! Cache Store Module
//!
//! The per-workload cache façade. Every operation hashes the key, locks the
//! owning bucket with a bounded wait and works on that bucket alone; the
//! manager is only involved for memory accounting and to dispatch background
//! work.

use std::mem;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use super::bucket::{BanishOutcome, Displaced};
use super::entry::CacheEntry;
use super::finding::{Finding, LookupOutcome};
use super::hash::BucketHash;
use super::locker::{BucketLocker, LockTimeout};
use super::lru::{EvictionPolicy, LeastRecentlyUsed};
use super::manager::Manager;
use super::metadata::Metadata;
use super::stats::{CacheStats, StatsRecorder};
use super::table::Table;
use super::{MAX_KEY_LENGTH, MAX_VALUE_SIZE};
use crate::error::{CacheError, Result};

/// Slack charged on top of the cache object itself.
const CACHE_PADDING: u64 = 64;

// == Cache Type ==
/// Whether a cache takes part in the banishment protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    /// No banishment; `banish` is a no-op
    Plain,
    /// Lookups honor banishments made by write transactions
    Transactional,
}

// == Cache ==
/// A named cache instance registered with a [`Manager`].
pub struct Cache {
    id: u64,
    name: String,
    cache_type: CacheType,
    manager: Arc<Manager>,
    this: Weak<Cache>,
    table: ArcSwap<Table>,
    metadata: Mutex<Metadata>,
    stats: StatsRecorder,
    policy: Box<dyn EvictionPolicy>,
    operation_timeout: LockTimeout,
    free_memory_cursor: AtomicUsize,
}

impl Cache {
    // == Constructor ==
    pub(crate) fn new(
        id: u64,
        name: String,
        cache_type: CacheType,
        manager: Arc<Manager>,
        table: Arc<Table>,
    ) -> Arc<Self> {
        let operation_timeout = LockTimeout::Bounded(manager.options().operation_lock_timeout);
        let metadata = Metadata::new(Self::fixed_size(), table.memory_usage());
        Arc::new_cyclic(|this| Self {
            id,
            name,
            cache_type,
            manager,
            this: this.clone(),
            table: ArcSwap::new(table),
            metadata: Mutex::new(metadata),
            stats: StatsRecorder::new(),
            policy: Box::new(LeastRecentlyUsed),
            operation_timeout,
            free_memory_cursor: AtomicUsize::new(0),
        })
    }

    /// Bytes charged for a cache before any table or entry.
    pub fn fixed_size() -> u64 {
        mem::size_of::<Cache>() as u64 + CACHE_PADDING
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    pub fn is_transactional(&self) -> bool {
        self.cache_type == CacheType::Transactional
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// The current primary table.
    pub fn table(&self) -> Arc<Table> {
        self.table.load_full()
    }

    /// True while a resize is in flight.
    pub fn is_migrating(&self) -> bool {
        self.table.load().auxiliary().is_some()
    }

    /// Bytes charged to this cache.
    pub fn usage(&self) -> u64 {
        self.metadata.lock().usage()
    }

    /// A copy of the accounting record.
    pub fn metadata(&self) -> Metadata {
        self.metadata.lock().clone()
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> CacheStats {
        let log_size = self.table.load().log_size();
        self.stats
            .snapshot(&self.name, self.cache_type, self.usage(), log_size)
    }

    // == Insert ==
    /// Stores `value` under `key`.
    ///
    /// Returns `Ok(false)` when the value was not cached: the bucket was busy,
    /// the key is banished, or the memory ceiling was reached. Only oversized
    /// or empty input is an error.
    pub fn insert(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<bool> {
        let key = key.into();
        let value = value.into();

        if key.is_empty() {
            return Err(CacheError::InvalidRequest("Key must not be empty".to_string()));
        }

        // Validate key length
        if key.len() > MAX_KEY_LENGTH {
            return Err(CacheError::InvalidRequest(format!(
                "Key exceeds maximum length of {} bytes",
                MAX_KEY_LENGTH
            )));
        }

        // Validate value size
        if value.len() > MAX_VALUE_SIZE {
            return Err(CacheError::InvalidRequest(format!(
                "Value exceeds maximum size of {} bytes",
                MAX_VALUE_SIZE
            )));
        }

        let hash = BucketHash::of(&key);
        let Some(mut bucket) = self.lock_bucket(hash, self.operation_timeout) else {
            self.stats.record_rejected_insertion();
            return Ok(false);
        };

        if self.is_transactional() && bucket.is_banished(hash, self.manager.current_term()) {
            self.stats.record_rejected_insertion();
            return Ok(false);
        }

        let entry = CacheEntry::with_hash(hash, key, value, self.manager.tick());
        if !self.reserve(entry.size()) {
            drop(bucket);
            self.stats.record_rejected_insertion();
            self.manager.request_rebalance();
            return Ok(false);
        }

        let source = Arc::clone(bucket.source());
        let wants_resize = match bucket.insert(entry, self.policy.as_ref()) {
            Displaced::Nothing => {
                self.stats.record_insertion();
                source.slot_filled()
            }
            Displaced::Replaced(old) => {
                self.release(old.size());
                self.stats.record_replacement();
                false
            }
            Displaced::Evicted(old) => {
                self.release(old.size());
                self.stats.record_eviction();
                self.stats.record_insertion();
                false
            }
            Displaced::Rejected(entry) => {
                drop(bucket);
                self.release(entry.size());
                self.stats.record_rejected_insertion();
                return Ok(false);
            }
        };
        drop(bucket);

        if wants_resize {
            self.request_resize(&source);
        }
        if self.manager.is_over_quota() {
            self.manager.request_rebalance();
        }
        Ok(true)
    }

    // == Lookup ==
    /// Looks up `key`. Banished keys are reported as misses even if a value
    /// is physically stored.
    pub fn lookup(&self, key: &[u8]) -> Finding {
        let hash = BucketHash::of(key);
        let Some(mut bucket) = self.lock_bucket(hash, self.operation_timeout) else {
            self.stats.record_miss();
            return Finding::miss(LookupOutcome::Busy);
        };

        if self.is_transactional() && bucket.is_banished(hash, self.manager.current_term()) {
            self.stats.record_banished_miss();
            return Finding::miss(LookupOutcome::Banished);
        }

        let tick = self.manager.tick();
        match bucket.find_mut(hash, key) {
            Some(entry) => {
                entry.touch(tick);
                self.stats.record_hit();
                Finding::hit(entry.value.clone())
            }
            None => {
                self.stats.record_miss();
                Finding::miss(LookupOutcome::Miss)
            }
        }
    }

    // == Remove ==
    /// Drops the value stored under `key`. Returns true if one was removed.
    pub fn remove(&self, key: &[u8]) -> bool {
        let hash = BucketHash::of(key);
        let Some(mut bucket) = self.lock_bucket(hash, self.operation_timeout) else {
            return false;
        };
        let Some(entry) = bucket.remove(hash, key) else {
            return false;
        };
        let source = Arc::clone(bucket.source());
        let wants_resize = source.slot_emptied();
        drop(bucket);

        self.release(entry.size());
        self.stats.record_removal();
        if wants_resize {
            self.request_resize(&source);
        }
        true
    }

    // == Banish ==
    /// Banishes `key` for the current transaction term and drops its value.
    ///
    /// Waits for the bucket without bound: a banishment that silently fails
    /// could let a stale value be served.
    pub(crate) fn banish(&self, key: &[u8]) -> bool {
        if !self.is_transactional() {
            return false;
        }
        let hash = BucketHash::of(key);
        let Some(mut bucket) = self.lock_bucket(hash, LockTimeout::Unbounded) else {
            return false;
        };

        let term = self.manager.current_term();
        let removed = bucket.remove(hash, key);
        let outcome = bucket.banish(hash, term);
        let source = Arc::clone(bucket.source());
        let wants_resize = removed.is_some() && source.slot_emptied();
        drop(bucket);

        if let Some(entry) = removed {
            self.release(entry.size());
            self.stats.record_removal();
        }
        if wants_resize {
            self.request_resize(&source);
        }

        match outcome {
            BanishOutcome::Stale => false,
            BanishOutcome::Overflowed => {
                debug!(cache = %self.name, term, "banish records overflowed, bucket banished");
                self.stats.record_banishment();
                true
            }
            BanishOutcome::Recorded | BanishOutcome::Refreshed => {
                self.stats.record_banishment();
                true
            }
        }
    }

    // == Bucket Access ==
    /// Locks the bucket serving `hash` in the current table.
    ///
    /// If the table this call started with was retired by a migration in the
    /// meantime, the lookup is repeated against its replacement.
    pub(crate) fn lock_bucket(&self, hash: BucketHash, timeout: LockTimeout) -> Option<BucketLocker> {
        loop {
            let table = self.table.load_full();
            if let Some(bucket) = table.fetch_and_lock_bucket(hash, timeout) {
                return Some(bucket);
            }
            if Arc::ptr_eq(&self.table.load(), &table) {
                return None;
            }
        }
    }

    pub(crate) fn policy(&self) -> &dyn EvictionPolicy {
        self.policy.as_ref()
    }

    pub(crate) fn free_memory_cursor(&self) -> &AtomicUsize {
        &self.free_memory_cursor
    }

    /// Evicts the policy's victim from a locked bucket. Returns false if the
    /// bucket was empty.
    pub(crate) fn evict_from(&self, bucket: &mut BucketLocker) -> bool {
        let Some(entry) = bucket.evict(self.policy.as_ref()) else {
            return false;
        };
        bucket.source().slot_emptied();
        self.release(entry.size());
        self.stats.record_eviction();
        true
    }

    /// Accounts for an entry dropped outside the foreground path.
    pub(crate) fn discard(&self, entry: &CacheEntry) {
        self.release(entry.size());
        self.stats.record_eviction();
    }

    fn request_resize(&self, source: &Arc<Table>) {
        let primary = self.table.load_full();
        if !Arc::ptr_eq(&primary, source) || primary.auxiliary().is_some() {
            return;
        }
        let ideal = primary.ideal_size();
        if ideal == primary.log_size() {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            self.manager.dispatch_migration(&this, ideal);
        }
    }

    // == Memory Accounting ==
    /// Charges `bytes` of entry data against the global ceiling.
    pub(crate) fn reserve(&self, bytes: u64) -> bool {
        let mut metadata = self.metadata.lock();
        if metadata.shutdown || !self.manager.try_reserve(bytes) {
            return false;
        }
        metadata.entry_usage += bytes;
        true
    }

    /// Returns `bytes` of entry data.
    pub(crate) fn release(&self, bytes: u64) {
        let mut metadata = self.metadata.lock();
        if metadata.shutdown {
            return;
        }
        let bytes = bytes.min(metadata.entry_usage);
        metadata.entry_usage -= bytes;
        self.manager.release(bytes);
    }

    /// Usage a running free-memory task is working towards.
    pub(crate) fn usage_target(&self) -> u64 {
        self.metadata.lock().usage_target
    }

    /// Entry bytes that freeing memory could give back.
    pub(crate) fn reclaimable(&self) -> u64 {
        let metadata = self.metadata.lock();
        metadata.usage() - metadata.floor()
    }

    // == Task Bookkeeping ==
    pub(crate) fn begin_free_memory(&self, usage_target: u64) -> bool {
        let mut metadata = self.metadata.lock();
        if !metadata.begin_freeing_memory() {
            return false;
        }
        metadata.usage_target = usage_target;
        true
    }

    pub(crate) fn end_free_memory(&self) {
        self.metadata.lock().end_freeing_memory();
    }

    /// Claims the migration slot and reserves the destination table.
    ///
    /// A growth whose allocation does not fit under the ceiling is skipped;
    /// a shrink always proceeds since it ends up returning memory. If an
    /// interrupted migration left an auxiliary behind, its reservation is
    /// still held and the task will resume it.
    pub(crate) fn begin_migration(&self, log_size: u32) -> bool {
        let table = self.table.load_full();
        let resuming = table.auxiliary().is_some();
        if !resuming && log_size == table.log_size() {
            return false;
        }

        let mut metadata = self.metadata.lock();
        if !metadata.begin_migrating() {
            return false;
        }
        if resuming || metadata.auxiliary_table_size > 0 {
            return true;
        }

        let bytes = Table::allocation_size(log_size);
        if log_size > table.log_size() {
            if !self.manager.try_reserve(bytes) {
                metadata.end_migrating();
                debug!(cache = %self.name, log_size, "growth skipped, allocation does not fit");
                return false;
            }
        } else {
            self.manager.force_reserve(bytes);
        }
        metadata.auxiliary_table_size = bytes;
        true
    }

    pub(crate) fn end_migration(&self) {
        self.metadata.lock().end_migrating();
    }

    /// Gives back the destination reservation of a migration that never
    /// installed its auxiliary.
    pub(crate) fn abandon_migration(&self) {
        let mut metadata = self.metadata.lock();
        if !metadata.shutdown && metadata.auxiliary_table_size > 0 {
            self.manager.release(metadata.auxiliary_table_size);
        }
        metadata.auxiliary_table_size = 0;
        metadata.end_migrating();
    }

    /// Promotes `replacement` to primary table and retires `retired`.
    pub(crate) fn complete_migration(&self, retired: &Arc<Table>, replacement: Arc<Table>) {
        let log_size = replacement.log_size();
        self.table.store(replacement);
        let _ = retired.set_auxiliary(None);
        retired.disable();

        let mut metadata = self.metadata.lock();
        if !metadata.shutdown {
            let freed = metadata.table_size;
            metadata.table_size = metadata.auxiliary_table_size;
            metadata.auxiliary_table_size = 0;
            self.manager.release(freed);
        }
        drop(metadata);

        info!(
            cache = %self.name,
            from = retired.log_size(),
            to = log_size,
            "migration complete"
        );
    }

    // == Shutdown ==
    /// Returns all of this cache's memory to the pool and disables its
    /// tables. Operations afterwards miss or are refused.
    pub(crate) fn shutdown(&self) {
        let table = self.table.load_full();
        {
            let mut metadata = self.metadata.lock();
            if metadata.shutdown {
                return;
            }
            self.manager.release(metadata.usage());
            metadata.shutdown = true;
            metadata.fixed_size = 0;
            metadata.table_size = 0;
            metadata.auxiliary_table_size = 0;
            metadata.entry_usage = 0;
        }

        if let Ok(Some(auxiliary)) = table.set_auxiliary(None) {
            auxiliary.disable();
        }
        table.disable();
        debug!(cache = %self.name, "cache shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.metadata.lock().shutdown
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("cache_type", &self.cache_type)
            .field("table", &self.table.load_full())
            .finish()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::bucket::SLOTS_PER_BUCKET;
    use crate::cache::MIN_LOG_SIZE;
    use crate::config::CacheOptions;
    use crate::tasks::QueueScheduler;

    fn setup(cache_type: CacheType) -> (Arc<Manager>, Arc<Cache>) {
        let manager = Manager::new(CacheOptions::default(), Arc::new(QueueScheduler::new())).unwrap();
        let cache = manager.create_cache("documents", cache_type).unwrap();
        (manager, cache)
    }

    fn colliding_keys(count: usize) -> Vec<String> {
        let target = BucketHash::of(b"anchor").index(MIN_LOG_SIZE);
        (0..)
            .map(|i| format!("key{}", i))
            .filter(|key| BucketHash::of(key.as_bytes()).index(MIN_LOG_SIZE) == target)
            .take(count)
            .collect()
    }

    #[test]
    fn test_insert_and_lookup() {
        let (_manager, cache) = setup(CacheType::Plain);
        assert!(cache.insert("doc/1", "payload").unwrap());

        let finding = cache.lookup(b"doc/1");
        assert!(finding.found());
        assert_eq!(finding.value().unwrap().as_ref(), b"payload");
        assert_eq!(cache.lookup(b"doc/2").outcome(), LookupOutcome::Miss);
    }

    #[test]
    fn test_overwrite_keeps_one_entry() {
        let (_manager, cache) = setup(CacheType::Plain);
        cache.insert("k", "v1").unwrap();
        let usage = cache.usage();
        cache.insert("k", "v2").unwrap();

        assert_eq!(cache.lookup(b"k").into_value().unwrap().as_ref(), b"v2");
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.usage(), usage);
    }

    #[test]
    fn test_remove_returns_memory() {
        let (_manager, cache) = setup(CacheType::Plain);
        let empty = cache.usage();
        cache.insert("k", "value").unwrap();
        assert!(cache.usage() > empty);

        assert!(cache.remove(b"k"));
        assert!(!cache.remove(b"k"));
        assert_eq!(cache.usage(), empty);
        assert!(!cache.lookup(b"k").found());
    }

    #[test]
    fn test_key_too_long() {
        let (_manager, cache) = setup(CacheType::Plain);
        let result = cache.insert("k".repeat(MAX_KEY_LENGTH + 1), "v");
        assert!(matches!(result, Err(CacheError::InvalidRequest(_))));
        assert!(matches!(cache.insert("", "v"), Err(CacheError::InvalidRequest(_))));
    }

    #[test]
    fn test_value_too_large() {
        let (_manager, cache) = setup(CacheType::Plain);
        let result = cache.insert("k", vec![0u8; MAX_VALUE_SIZE + 1]);
        assert!(matches!(result, Err(CacheError::InvalidRequest(_))));
    }

    #[test]
    fn test_full_bucket_evicts_least_recently_used() {
        let (_manager, cache) = setup(CacheType::Plain);
        let keys = colliding_keys(SLOTS_PER_BUCKET + 1);
        for key in &keys[..SLOTS_PER_BUCKET] {
            assert!(cache.insert(key.clone(), "v").unwrap());
        }
        // refresh the first key so the second becomes the victim
        assert!(cache.lookup(keys[0].as_bytes()).found());

        assert!(cache.insert(keys[SLOTS_PER_BUCKET].clone(), "v").unwrap());
        assert!(cache.lookup(keys[0].as_bytes()).found());
        assert!(!cache.lookup(keys[1].as_bytes()).found());

        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entries, SLOTS_PER_BUCKET as u64);
    }

    #[test]
    fn test_plain_cache_ignores_banish() {
        let (_manager, cache) = setup(CacheType::Plain);
        cache.insert("k", "v").unwrap();
        assert!(!cache.banish(b"k"));
        assert!(cache.lookup(b"k").found());
    }

    #[test]
    fn test_banish_drops_value_and_refuses_insert() {
        let (manager, cache) = setup(CacheType::Transactional);
        cache.insert("k", "v").unwrap();

        let mut transaction = manager.begin_transaction(false);
        assert!(transaction.banish(&cache, b"k"));
        assert_eq!(cache.lookup(b"k").outcome(), LookupOutcome::Banished);
        assert!(!cache.insert("k", "v2").unwrap());
        assert_eq!(cache.stats().entries, 0);

        transaction.commit();
        assert!(cache.insert("k", "v2").unwrap());
        assert_eq!(cache.lookup(b"k").into_value().unwrap().as_ref(), b"v2");
    }

    #[test]
    fn test_stats_accuracy() {
        let (_manager, cache) = setup(CacheType::Plain);
        cache.insert("a", "1").unwrap();
        cache.lookup(b"a");
        cache.lookup(b"a");
        cache.lookup(b"missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.insertions, 1);
        assert_eq!(stats.log_size, MIN_LOG_SIZE);
    }

    #[test]
    fn test_shutdown_cache_refuses_everything() {
        let (manager, cache) = setup(CacheType::Plain);
        cache.insert("k", "v").unwrap();
        let before = manager.global_usage();
        assert!(before > 0);

        cache.shutdown();
        assert!(cache.is_shutdown());
        assert_eq!(manager.global_usage(), 0);
        assert!(!cache.insert("k2", "v").unwrap());
        assert_eq!(cache.lookup(b"k").outcome(), LookupOutcome::Busy);
    }

    #[test]
    fn test_reclaimable_excludes_tables() {
        let (_manager, cache) = setup(CacheType::Plain);
        cache.insert("k", "v").unwrap();
        let entries = cache.metadata().entry_usage;
        assert_eq!(cache.reclaimable(), entries);

        // a reserved migration target is never reclaimable
        assert!(cache.begin_migration(MIN_LOG_SIZE + 1));
        assert!(cache.metadata().auxiliary_table_size > 0);
        assert_eq!(cache.reclaimable(), entries);
        assert_eq!(cache.usage() - cache.reclaimable(), cache.metadata().floor());
        cache.abandon_migration();
    }
}
