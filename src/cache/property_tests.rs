//! Property-Based Tests for Cache Module
//!
//! Uses proptest to check the table, bucket and banishment invariants over
//! generated inputs.

use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;

use crate::cache::{
    Bucket, BucketHash, Cache, CacheEntry, CacheType, LeastRecentlyUsed, LockTimeout,
    LookupOutcome, Manager, Table, MIN_LOG_SIZE, SLOTS_PER_BUCKET,
};
use crate::config::CacheOptions;
use crate::tasks::QueueScheduler;

// == Helpers ==
fn new_cache(cache_type: CacheType) -> (Arc<Manager>, Arc<Cache>) {
    let manager = Manager::new(CacheOptions::default(), Arc::new(QueueScheduler::new())).unwrap();
    let cache = manager.create_cache("documents", cache_type).unwrap();
    (manager, cache)
}

fn table(log_size: u32) -> Arc<Table> {
    Arc::new(Table::new(log_size, &CacheOptions::default()).unwrap())
}

// == Strategies ==
/// Generates valid cache keys (non-empty, within length limit)
fn valid_key_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_]{1,64}".prop_map(|s| s)
}

/// Generates valid cache values (within size limit)
fn valid_value_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ]{1,256}".prop_map(|s| s)
}

/// Generates a sequence of cache operations for testing
#[derive(Debug, Clone)]
enum CacheOp {
    Insert { key: String, value: String },
    Lookup { key: String },
    Remove { key: String },
}

fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        (valid_key_strategy(), valid_value_strategy())
            .prop_map(|(key, value)| CacheOp::Insert { key, value }),
        valid_key_strategy().prop_map(|key| CacheOp::Lookup { key }),
        valid_key_strategy().prop_map(|key| CacheOp::Remove { key }),
    ]
}

/// Operations a write transaction interleaves with readers, over a small key
/// space so that keys collide.
#[derive(Debug, Clone)]
enum TxOp {
    Insert(u8),
    Banish(u8),
    Lookup(u8),
}

fn tx_op_strategy() -> impl Strategy<Value = TxOp> {
    prop_oneof![
        (0u8..16).prop_map(TxOp::Insert),
        (0u8..16).prop_map(TxOp::Banish),
        (0u8..16).prop_map(TxOp::Lookup),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // Statistics accuracy: hits and misses match what lookups returned, and
    // the entry count matches the table's fill counter.
    #[test]
    fn prop_statistics_accuracy(ops in prop::collection::vec(cache_op_strategy(), 1..50)) {
        let (manager, cache) = new_cache(CacheType::Plain);
        let mut expected_hits: u64 = 0;
        let mut expected_misses: u64 = 0;

        for op in ops {
            match op {
                CacheOp::Insert { key, value } => {
                    let _ = cache.insert(key, value);
                }
                CacheOp::Lookup { key } => {
                    if cache.lookup(key.as_bytes()).found() {
                        expected_hits += 1;
                    } else {
                        expected_misses += 1;
                    }
                }
                CacheOp::Remove { key } => {
                    cache.remove(key.as_bytes());
                }
            }
        }

        let stats = cache.stats();
        prop_assert_eq!(stats.hits, expected_hits, "Hits mismatch");
        prop_assert_eq!(stats.misses, expected_misses, "Misses mismatch");
        prop_assert_eq!(stats.entries, cache.table().slots_filled(), "Entry count mismatch");
        prop_assert_eq!(manager.global_usage(), cache.usage(), "Global usage mismatch");
    }

    // Round trip: a stored value is returned unchanged by the next lookup.
    #[test]
    fn prop_roundtrip_storage(key in valid_key_strategy(), value in valid_value_strategy()) {
        let (_manager, cache) = new_cache(CacheType::Transactional);
        prop_assert!(cache.insert(key.clone(), value.clone()).unwrap());

        let finding = cache.lookup(key.as_bytes());
        prop_assert_eq!(finding.into_value(), Some(Bytes::from(value)), "Round-trip value mismatch");
    }

    // Bucket occupancy never exceeds its slot count and the newest insert
    // always survives eviction.
    #[test]
    fn prop_bucket_occupancy_bounded(keys in prop::collection::vec(valid_key_strategy(), 1..64)) {
        let mut bucket = Bucket::new();
        for (tick, key) in keys.iter().enumerate() {
            let entry = CacheEntry::new(Bytes::from(key.clone()), Bytes::from_static(b"v"), tick as u64);
            bucket.insert(entry, &LeastRecentlyUsed);
            prop_assert!(bucket.occupied() <= SLOTS_PER_BUCKET);
            prop_assert!(bucket.find(BucketHash::of(key.as_bytes()), key.as_bytes()).is_some());
        }
    }

    // Banished keys never hit while their transaction is open, and become
    // cacheable again once it finalizes.
    #[test]
    fn prop_banished_keys_never_hit(ops in prop::collection::vec(tx_op_strategy(), 1..80)) {
        let (manager, cache) = new_cache(CacheType::Transactional);
        let mut transaction = manager.begin_transaction(false);
        let mut banished = HashSet::new();

        for op in ops {
            match op {
                TxOp::Insert(k) => {
                    let stored = cache.insert(format!("key{}", k), "value").unwrap();
                    if banished.contains(&k) {
                        prop_assert!(!stored, "Banished key was cached");
                    }
                }
                TxOp::Banish(k) => {
                    let key = format!("key{}", k);
                    prop_assert!(transaction.banish(&cache, key.as_bytes()));
                    banished.insert(k);
                }
                TxOp::Lookup(k) => {
                    let finding = cache.lookup(format!("key{}", k).as_bytes());
                    if banished.contains(&k) {
                        prop_assert!(!finding.found(), "Banished key returned a hit");
                        prop_assert_eq!(finding.outcome(), LookupOutcome::Banished);
                    }
                }
            }
        }

        transaction.commit();
        for k in banished {
            let key = format!("key{}", k);
            prop_assert!(cache.insert(key.clone(), "fresh").unwrap());
            prop_assert_eq!(
                cache.lookup(key.as_bytes()).into_value(),
                Some(Bytes::from_static(b"fresh"))
            );
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    // Fill ratio round trip: filling to size() crosses the upper threshold
    // exactly once, emptying crosses the lower threshold exactly once, and
    // the counter returns to zero.
    #[test]
    fn prop_fill_ratio_round_trip(log_size in (MIN_LOG_SIZE + 1)..=(MIN_LOG_SIZE + 3)) {
        let table = table(log_size);

        let mut upper_crossings = 0;
        let mut above = false;
        for _ in 0..table.size() {
            let now = table.slot_filled();
            if now && !above {
                upper_crossings += 1;
            }
            above = now;
        }
        prop_assert_eq!(upper_crossings, 1);
        prop_assert_eq!(table.ideal_size(), log_size + 1);

        let mut lower_crossings = 0;
        let mut below = false;
        for _ in 0..table.size() {
            let now = table.slot_emptied();
            if now && !below {
                lower_crossings += 1;
            }
            below = now;
        }
        prop_assert_eq!(lower_crossings, 1);
        prop_assert_eq!(table.ideal_size(), log_size - 1);
        prop_assert_eq!(table.slots_filled(), 0);
    }

    // Growth mapping: a migrated bucket i of the small table resolves to
    // bucket i << d of an auxiliary d levels larger.
    #[test]
    fn prop_growth_index_mapping(index in 0usize..256, delta in 1u32..=3) {
        let small = table(MIN_LOG_SIZE);
        let large = table(MIN_LOG_SIZE + delta);
        prop_assert!(small.set_auxiliary(Some(Arc::clone(&large))).unwrap().is_none());

        let hash = BucketHash::for_index(index as u64, MIN_LOG_SIZE);
        small
            .fetch_and_lock_bucket(hash, LockTimeout::Unbounded)
            .unwrap()
            .mark_migrated();

        let guard = small.fetch_and_lock_bucket(hash, LockTimeout::Unbounded).unwrap();
        prop_assert!(Arc::ptr_eq(guard.source(), &large));
        prop_assert_eq!(guard.index(), index << delta);
    }

    // Shrink mapping: a migrated bucket j of the large table resolves to
    // bucket j >> d of an auxiliary d levels smaller.
    #[test]
    fn prop_shrink_index_mapping(index in 0usize..2048, delta in 1u32..=3) {
        let large = table(MIN_LOG_SIZE + delta);
        let small = table(MIN_LOG_SIZE);
        let index = index % large.size() as usize;
        large.set_auxiliary(Some(Arc::clone(&small))).unwrap();

        let hash = BucketHash::for_index(index as u64, MIN_LOG_SIZE + delta);
        large
            .fetch_and_lock_bucket(hash, LockTimeout::Unbounded)
            .unwrap()
            .mark_migrated();

        let guard = large.fetch_and_lock_bucket(hash, LockTimeout::Unbounded).unwrap();
        prop_assert!(Arc::ptr_eq(guard.source(), &small));
        prop_assert_eq!(guard.index(), index >> delta);
    }
}
