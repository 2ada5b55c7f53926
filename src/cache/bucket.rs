//! Bucket Module
//!
//! A bucket is the unit of locking: a bounded group of entry slots plus
//! state flags and the banishment records used by write transactions.
//! Every method here assumes the caller holds the bucket's lock; the
//! table hands buckets out only through a locked guard.

use super::entry::CacheEntry;
use super::hash::BucketHash;
use super::lru::EvictionPolicy;

/// Entry slots per bucket.
pub const SLOTS_PER_BUCKET: usize = 8;

/// Banishment records kept per bucket before the oldest is dropped.
pub const BANISH_SLOTS: usize = 4;

/// Nominal bytes charged per bucket in a table allocation.
pub const BUCKET_SIZE_IN_BYTES: u64 = 64;

// == Bucket State ==
/// Bucket-level flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketState(u8);

/// A single flag in a [`BucketState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    /// Contents were moved to the auxiliary table. Never cleared.
    Migrated,
    /// Every key in the bucket is banished for the recorded term.
    Banished,
}

impl Flag {
    #[inline]
    fn bit(self) -> u8 {
        match self {
            Flag::Migrated => 0b01,
            Flag::Banished => 0b10,
        }
    }
}

impl BucketState {
    /// True if `flag` is set.
    #[inline]
    pub fn is_set(self, flag: Flag) -> bool {
        self.0 & flag.bit() != 0
    }

    #[inline]
    fn set(&mut self, flag: Flag) {
        self.0 |= flag.bit();
    }

    #[inline]
    fn clear(&mut self, flag: Flag) {
        self.0 &= !flag.bit();
    }
}

// == Banish Record ==
/// Suppresses hits for one key digest while `term` is the current
/// transaction term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanishRecord {
    /// Digest of the banished key
    pub hash: BucketHash,
    /// Transaction term the banishment belongs to
    pub term: u64,
}

/// What happened when a banishment was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanishOutcome {
    /// A new record was stored
    Recorded,
    /// The key already had a record; its term was refreshed
    Refreshed,
    /// The record list was full: the oldest record was dropped and the whole
    /// bucket is banished for the term
    Overflowed,
    /// The bucket already holds records from a newer term
    Stale,
}

/// What an insert displaced, if anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Displaced {
    /// A free slot was filled
    Nothing,
    /// An entry for the same key was overwritten
    Replaced(CacheEntry),
    /// The bucket was full and this victim was evicted
    Evicted(CacheEntry),
    /// The bucket was full and the policy named no victim; the new entry is
    /// handed back unstored
    Rejected(CacheEntry),
}

// == Bucket ==
/// Fixed-capacity slot storage plus state, guarded by the owning table.
#[derive(Debug, Default)]
pub struct Bucket {
    state: BucketState,
    /// Term of the bucket-wide banishment, meaningful while `Banished` is set
    banish_term: u64,
    /// Occupied slots, never more than `SLOTS_PER_BUCKET`
    slots: Vec<CacheEntry>,
    /// Oldest record first, never more than `BANISH_SLOTS`
    banished: Vec<BanishRecord>,
}

impl Bucket {
    /// Creates an empty bucket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state flags.
    pub fn state(&self) -> BucketState {
        self.state
    }

    // == Migration ==
    /// True once the bucket's contents live in the auxiliary table.
    #[inline]
    pub fn is_migrated(&self) -> bool {
        self.state.is_set(Flag::Migrated)
    }

    /// Marks the bucket migrated. One-way.
    pub fn mark_migrated(&mut self) {
        self.state.set(Flag::Migrated);
    }

    // == Slots ==
    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.slots.len()
    }

    /// True if no slot is free.
    pub fn is_full(&self) -> bool {
        self.slots.len() >= SLOTS_PER_BUCKET
    }

    /// True if no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Occupied slots in slot order.
    pub fn entries(&self) -> &[CacheEntry] {
        &self.slots
    }

    /// Finds the entry for `key`.
    pub fn find(&self, hash: BucketHash, key: &[u8]) -> Option<&CacheEntry> {
        self.slots.iter().find(|entry| entry.matches(hash, key))
    }

    /// Finds the entry for `key` for update.
    pub fn find_mut(&mut self, hash: BucketHash, key: &[u8]) -> Option<&mut CacheEntry> {
        self.slots.iter_mut().find(|entry| entry.matches(hash, key))
    }

    /// Stores `entry`, overwriting the same key or evicting a victim chosen by
    /// `policy` when the bucket is full.
    pub fn insert(&mut self, entry: CacheEntry, policy: &dyn EvictionPolicy) -> Displaced {
        if let Some(position) = self
            .slots
            .iter()
            .position(|existing| existing.matches(entry.hash, &entry.key))
        {
            let old = std::mem::replace(&mut self.slots[position], entry);
            return Displaced::Replaced(old);
        }

        if !self.is_full() {
            self.slots.push(entry);
            return Displaced::Nothing;
        }

        match policy.select_victim(&self.slots) {
            Some(victim) => {
                let old = self.slots.remove(victim);
                self.slots.push(entry);
                Displaced::Evicted(old)
            }
            None => Displaced::Rejected(entry),
        }
    }

    /// Removes and returns the entry for `key`.
    pub fn remove(&mut self, hash: BucketHash, key: &[u8]) -> Option<CacheEntry> {
        let position = self.slots.iter().position(|entry| entry.matches(hash, key))?;
        Some(self.slots.remove(position))
    }

    /// Removes the entry `policy` picks as victim.
    pub fn evict(&mut self, policy: &dyn EvictionPolicy) -> Option<CacheEntry> {
        let victim = policy.select_victim(&self.slots)?;
        Some(self.slots.remove(victim))
    }

    /// Removes every entry, leaving the slots empty.
    pub fn take_entries(&mut self) -> Vec<CacheEntry> {
        std::mem::take(&mut self.slots)
    }

    // == Banishment ==
    /// Records a banishment of `hash` for `term`.
    ///
    /// Records from older terms can no longer be active and are purged first.
    /// On overflow the oldest record is dropped and the bucket-wide flag is
    /// raised for `term`, so the drop can only cause extra misses.
    pub fn banish(&mut self, hash: BucketHash, term: u64) -> BanishOutcome {
        self.purge_banishments(term);

        if self.banished.iter().any(|record| record.term > term) {
            return BanishOutcome::Stale;
        }

        if let Some(record) = self.banished.iter_mut().find(|record| record.hash == hash) {
            record.term = term;
            return BanishOutcome::Refreshed;
        }

        let mut outcome = BanishOutcome::Recorded;
        if self.banished.len() >= BANISH_SLOTS {
            self.banished.remove(0);
            self.banish_all(term);
            outcome = BanishOutcome::Overflowed;
        }
        self.banished.push(BanishRecord { hash, term });
        outcome
    }

    /// Banishes every key in the bucket for `term`.
    pub fn banish_all(&mut self, term: u64) {
        if self.state.is_set(Flag::Banished) && self.banish_term > term {
            return;
        }
        self.state.set(Flag::Banished);
        self.banish_term = term;
    }

    /// True if `hash` must not be served while `term` is current.
    pub fn is_banished(&self, hash: BucketHash, term: u64) -> bool {
        self.is_fully_banished(term)
            || self
                .banished
                .iter()
                .any(|record| record.hash == hash && record.term == term)
    }

    /// True if the whole bucket is banished while `term` is current.
    pub fn is_fully_banished(&self, term: u64) -> bool {
        self.state.is_set(Flag::Banished) && self.banish_term == term
    }

    /// Term of the bucket-wide banishment, if the flag is set.
    pub fn bucket_banish_term(&self) -> Option<u64> {
        self.state
            .is_set(Flag::Banished)
            .then_some(self.banish_term)
    }

    /// Stored banishment records, oldest first.
    pub fn banish_records(&self) -> &[BanishRecord] {
        &self.banished
    }

    fn purge_banishments(&mut self, term: u64) {
        self.banished.retain(|record| record.term >= term);
        if self.state.is_set(Flag::Banished) && self.banish_term < term {
            self.state.clear(Flag::Banished);
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::lru::LeastRecentlyUsed;
    use bytes::Bytes;

    fn entry(key: &str, tick: u64) -> CacheEntry {
        CacheEntry::new(Bytes::from(key.to_string()), Bytes::from_static(b"v"), tick)
    }

    #[test]
    fn test_insert_find_remove() {
        let mut bucket = Bucket::new();
        assert_eq!(
            bucket.insert(entry("a", 1), &LeastRecentlyUsed),
            Displaced::Nothing
        );

        let hash = BucketHash::of(b"a");
        assert!(bucket.find(hash, b"a").is_some());
        assert_eq!(bucket.occupied(), 1);

        let removed = bucket.remove(hash, b"a").unwrap();
        assert_eq!(removed.key.as_ref(), b"a");
        assert!(bucket.is_empty());
        assert!(bucket.remove(hash, b"a").is_none());
    }

    #[test]
    fn test_insert_same_key_replaces() {
        let mut bucket = Bucket::new();
        bucket.insert(entry("a", 1), &LeastRecentlyUsed);

        let displaced = bucket.insert(entry("a", 2), &LeastRecentlyUsed);
        assert!(matches!(displaced, Displaced::Replaced(old) if old.last_access == 1));
        assert_eq!(bucket.occupied(), 1);
    }

    #[test]
    fn test_full_bucket_evicts_oldest() {
        let mut bucket = Bucket::new();
        for i in 0..SLOTS_PER_BUCKET {
            bucket.insert(entry(&format!("k{}", i), 10 + i as u64), &LeastRecentlyUsed);
        }
        assert!(bucket.is_full());

        // touch k0 so k1 becomes the oldest
        bucket
            .find_mut(BucketHash::of(b"k0"), b"k0")
            .unwrap()
            .touch(100);

        let displaced = bucket.insert(entry("new", 101), &LeastRecentlyUsed);
        assert!(matches!(displaced, Displaced::Evicted(old) if old.key.as_ref() == b"k1"));
        assert_eq!(bucket.occupied(), SLOTS_PER_BUCKET);
        assert!(bucket.find(BucketHash::of(b"new"), b"new").is_some());
    }

    #[test]
    fn test_migrated_flag_is_sticky() {
        let mut bucket = Bucket::new();
        assert!(!bucket.is_migrated());
        bucket.mark_migrated();
        bucket.mark_migrated();
        assert!(bucket.is_migrated());
        assert!(bucket.state().is_set(Flag::Migrated));
    }

    #[test]
    fn test_banish_is_term_scoped() {
        let mut bucket = Bucket::new();
        let hash = BucketHash(42);

        assert_eq!(bucket.banish(hash, 1), BanishOutcome::Recorded);
        assert!(bucket.is_banished(hash, 1));
        assert!(!bucket.is_banished(BucketHash(43), 1));
        // once the term moves on the record is inert
        assert!(!bucket.is_banished(hash, 2));
        assert!(!bucket.is_banished(hash, 3));
    }

    #[test]
    fn test_banish_is_idempotent() {
        let mut bucket = Bucket::new();
        let hash = BucketHash(7);

        assert_eq!(bucket.banish(hash, 3), BanishOutcome::Recorded);
        assert_eq!(bucket.banish(hash, 3), BanishOutcome::Refreshed);
        assert_eq!(bucket.banish_records().len(), 1);
    }

    #[test]
    fn test_banish_overflow_banishes_whole_bucket() {
        let mut bucket = Bucket::new();
        for i in 0..BANISH_SLOTS as u32 {
            assert_eq!(bucket.banish(BucketHash(i), 5), BanishOutcome::Recorded);
        }

        let outcome = bucket.banish(BucketHash(99), 5);
        assert_eq!(outcome, BanishOutcome::Overflowed);
        assert_eq!(bucket.banish_records().len(), BANISH_SLOTS);
        // the dropped record is still covered by the bucket-wide flag
        assert!(bucket.is_banished(BucketHash(0), 5));
        assert!(bucket.is_banished(BucketHash(12345), 5));
        assert_eq!(bucket.bucket_banish_term(), Some(5));
        assert!(!bucket.is_banished(BucketHash(0), 6));
    }

    #[test]
    fn test_stale_records_are_purged() {
        let mut bucket = Bucket::new();
        for i in 0..BANISH_SLOTS as u32 {
            bucket.banish(BucketHash(i), 1);
        }
        bucket.banish_all(1);

        assert_eq!(bucket.banish(BucketHash(100), 3), BanishOutcome::Recorded);
        assert_eq!(bucket.banish_records().len(), 1);
        assert_eq!(bucket.bucket_banish_term(), None);
    }

    #[test]
    fn test_older_term_record_is_stale() {
        let mut bucket = Bucket::new();
        bucket.banish(BucketHash(1), 5);
        assert_eq!(bucket.banish(BucketHash(2), 3), BanishOutcome::Stale);
        assert!(!bucket.is_banished(BucketHash(2), 3));
    }
}
