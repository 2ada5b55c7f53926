//! Table Module
//!
//! A table is `2^log_size` individually locked buckets addressed by the top
//! bits of a [`BucketHash`]. During a resize a table carries one auxiliary
//! table of a different size: buckets flagged as migrated are transparently
//! served from the auxiliary, everything else from the table itself. Only
//! one bucket pair is ever locked at a time, so a resize never pauses the
//! whole table.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use super::bucket::{Bucket, BUCKET_SIZE_IN_BYTES};
use super::hash::BucketHash;
use super::locker::{lock_cell, BucketCell, BucketLocker, LockTimeout};
use crate::config::CacheOptions;
use crate::error::{CacheError, Result};

/// Smallest supported table log size.
pub const MIN_LOG_SIZE: u32 = 8;

/// Largest supported table log size.
pub const MAX_LOG_SIZE: u32 = 32;

/// Alignment slack charged on every table allocation.
pub const TABLE_PADDING: u64 = 64;

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

// == Table ==
/// A resizable array of buckets.
pub struct Table {
    id: u64,
    log_size: u32,
    size: u64,
    buckets: Box<[BucketCell]>,
    auxiliary: Mutex<Option<Arc<Table>>>,
    enabled: AtomicBool,
    slots_filled: AtomicU64,
    ideal_size: AtomicU32,
    lower_threshold: f64,
    upper_threshold: f64,
    min_log_size: u32,
    max_log_size: u32,
}

impl Table {
    // == Constructor ==
    /// Allocates an enabled table of `2^log_size` empty buckets.
    ///
    /// Fill thresholds and the range `ideal_size()` may suggest come from
    /// `options`.
    pub fn new(log_size: u32, options: &CacheOptions) -> Result<Self> {
        if !(MIN_LOG_SIZE..=MAX_LOG_SIZE).contains(&log_size) {
            return Err(CacheError::LogSizeOutOfRange(log_size));
        }

        let size = 1u64 << log_size;
        let buckets = (0..size)
            .map(|_| Arc::new(Mutex::new(Bucket::new())))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let table = Self {
            id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            log_size,
            size,
            buckets,
            auxiliary: Mutex::new(None),
            enabled: AtomicBool::new(true),
            slots_filled: AtomicU64::new(0),
            ideal_size: AtomicU32::new(log_size),
            lower_threshold: options.ideal_lower_fill_ratio * size as f64,
            upper_threshold: options.ideal_upper_fill_ratio * size as f64,
            min_log_size: options.min_log_size.min(log_size),
            max_log_size: options.max_log_size.max(log_size),
        };
        table.update_ideal_size(0);
        Ok(table)
    }

    // == Sizing ==
    /// Bytes charged for a table of the given log size.
    pub fn allocation_size(log_size: u32) -> u64 {
        mem::size_of::<Table>() as u64 + (BUCKET_SIZE_IN_BYTES << log_size) + TABLE_PADDING
    }

    /// Bytes charged for this table.
    pub fn memory_usage(&self) -> u64 {
        Self::allocation_size(self.log_size)
    }

    /// Process-unique table identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Base-2 logarithm of the bucket count.
    pub fn log_size(&self) -> u32 {
        self.log_size
    }

    /// Number of buckets.
    pub fn size(&self) -> u64 {
        self.size
    }

    // == Enable / Disable ==
    /// Lets lookups reach this table again.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// Makes every subsequent lookup fail; used when a table is retired.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// True unless the table was retired.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    // == Bucket Access ==
    /// The bucket at `index`, unlocked.
    pub fn primary_bucket(&self, index: usize) -> &BucketCell {
        &self.buckets[index]
    }

    /// Locks the bucket serving `hash`.
    ///
    /// If that bucket has already been migrated, the lookup falls through to
    /// the matching bucket of the auxiliary table. Returns `None` if the
    /// table is disabled, the lock is not acquired within `timeout`, or a
    /// migrated bucket has no auxiliary left to fall through to.
    pub fn fetch_and_lock_bucket(
        self: &Arc<Self>,
        hash: BucketHash,
        timeout: LockTimeout,
    ) -> Option<BucketLocker> {
        let guard = self.lock_primary_for(hash, timeout)?;
        if !guard.is_migrated() {
            return Some(guard);
        }
        drop(guard);

        let auxiliary = self.auxiliary()?;
        let guard = auxiliary.lock_primary_for(hash, timeout)?;
        if guard.is_migrated() {
            // the auxiliary is never itself migrating while linked
            return None;
        }
        Some(guard)
    }

    /// Locks the bucket at `index` of this table, without redirection.
    pub fn lock_primary(self: &Arc<Self>, index: usize, timeout: LockTimeout) -> Option<BucketLocker> {
        if !self.is_enabled() || index >= self.buckets.len() {
            return None;
        }
        let guard = lock_cell(&self.buckets[index], timeout)?;
        Some(BucketLocker::new(guard, Arc::clone(self), index))
    }

    fn lock_primary_for(self: &Arc<Self>, hash: BucketHash, timeout: LockTimeout) -> Option<BucketLocker> {
        self.lock_primary(hash.index(self.log_size), timeout)
    }

    /// Runs `f` on every bucket in index order, each locked for its call.
    ///
    /// Stops at the first bucket that cannot be locked within `timeout` or
    /// for which `f` returns `false`; later buckets are left untouched.
    pub fn apply_to_all_buckets<F>(&self, timeout: LockTimeout, f: F) -> bool
    where
        F: FnMut(&mut Bucket) -> bool,
    {
        apply_to_range(&self.buckets, timeout, f)
    }

    // == Auxiliary ==
    /// The auxiliary table, if a migration is in flight.
    pub fn auxiliary(&self) -> Option<Arc<Table>> {
        self.auxiliary.lock().clone()
    }

    /// Installs or clears the auxiliary table.
    ///
    /// Installing returns the previous auxiliary: `None` for a fresh install,
    /// or the same table when re-installing it to resume a migration.
    /// Installing a different table while one is linked leaves the existing
    /// link in place and fails with [`CacheError::AuxiliaryConflict`]; a
    /// table of the same size fails with [`CacheError::AuxiliarySizeMismatch`].
    /// Clearing (`None`) returns whatever was linked.
    pub fn set_auxiliary(&self, table: Option<Arc<Table>>) -> Result<Option<Arc<Table>>> {
        let mut slot = self.auxiliary.lock();
        let Some(table) = table else {
            return Ok(slot.take());
        };

        if table.id == self.id || table.log_size == self.log_size {
            error!(
                table = self.id,
                log_size = self.log_size,
                auxiliary_log_size = table.log_size,
                "refusing auxiliary with identical size"
            );
            return Err(CacheError::AuxiliarySizeMismatch(self.log_size));
        }

        match slot.as_ref() {
            Some(existing) if Arc::ptr_eq(existing, &table) => Ok(Some(table)),
            Some(existing) => {
                error!(
                    table = self.id,
                    existing = existing.id,
                    requested = table.id,
                    "auxiliary already installed"
                );
                Err(CacheError::AuxiliaryConflict {
                    current: self.log_size,
                    existing: existing.log_size,
                })
            }
            None => {
                *slot = Some(table);
                Ok(None)
            }
        }
    }

    /// The buckets of the auxiliary table that correspond to bucket `index`
    /// of this table: `2^d` buckets starting at `index << d` when the
    /// auxiliary is `d` levels larger, the single bucket `index >> d` when it
    /// is `d` levels smaller.
    pub fn auxiliary_buckets(&self, index: usize) -> Option<Subtable> {
        let auxiliary = self.auxiliary()?;
        if index >= self.buckets.len() {
            return None;
        }
        let (start, len) = if auxiliary.log_size > self.log_size {
            let delta = auxiliary.log_size - self.log_size;
            (index << delta, 1usize << delta)
        } else {
            let delta = self.log_size - auxiliary.log_size;
            (index >> delta, 1)
        };
        debug_assert!(start + len <= auxiliary.buckets.len());
        Some(Subtable {
            table: auxiliary,
            start,
            len,
        })
    }

    // == Fill Ratio ==
    /// Records one more occupied slot. Returns `true` while the fill count is
    /// above the upper threshold, i.e. the table wants to grow.
    pub fn slot_filled(&self) -> bool {
        let filled = self.slots_filled.fetch_add(1, Ordering::AcqRel) + 1;
        self.update_ideal_size(filled);
        filled as f64 > self.upper_threshold
    }

    /// Records one fewer occupied slot. Returns `true` while the fill count
    /// is below the lower threshold, i.e. the table wants to shrink.
    pub fn slot_emptied(&self) -> bool {
        let previous = self
            .slots_filled
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        let filled = previous.saturating_sub(1);
        self.update_ideal_size(filled);
        (filled as f64) < self.lower_threshold
    }

    /// Current number of occupied slots.
    pub fn slots_filled(&self) -> u64 {
        self.slots_filled.load(Ordering::Acquire)
    }

    /// The log size this table should have for its current fill count.
    pub fn ideal_size(&self) -> u32 {
        self.ideal_size.load(Ordering::Acquire)
    }

    fn update_ideal_size(&self, filled: u64) {
        let filled = filled as f64;
        let ideal = if filled < self.lower_threshold {
            self.log_size.saturating_sub(1).max(self.min_log_size)
        } else if filled > self.upper_threshold {
            (self.log_size + 1).min(self.max_log_size)
        } else {
            self.log_size
        };
        self.ideal_size.store(ideal, Ordering::Release);
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("log_size", &self.log_size)
            .field("enabled", &self.is_enabled())
            .field("slots_filled", &self.slots_filled())
            .field("ideal_size", &self.ideal_size())
            .field("auxiliary", &self.auxiliary().map(|t| t.id))
            .finish()
    }
}

// == Subtable ==
/// A contiguous range of buckets in one table.
#[derive(Clone)]
pub struct Subtable {
    table: Arc<Table>,
    start: usize,
    len: usize,
}

impl Subtable {
    /// The table the range belongs to.
    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    /// First bucket index of the range.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Number of buckets in the range.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; a subtable covers at least one bucket.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Position of the bucket serving `hash` within the range.
    pub fn position(&self, hash: BucketHash) -> Option<usize> {
        let index = hash.index(self.table.log_size);
        (self.start..self.start + self.len)
            .contains(&index)
            .then(|| index - self.start)
    }

    /// Locks every bucket of the range in ascending order. All or nothing.
    pub fn lock_all(&self, timeout: LockTimeout) -> Option<Vec<BucketLocker>> {
        (self.start..self.start + self.len)
            .map(|index| self.table.lock_primary(index, timeout))
            .collect()
    }

    /// Runs `f` on every bucket of the range, each locked for its call.
    pub fn apply_to_all_buckets<F>(&self, timeout: LockTimeout, f: F) -> bool
    where
        F: FnMut(&mut Bucket) -> bool,
    {
        apply_to_range(&self.table.buckets[self.start..self.start + self.len], timeout, f)
    }
}

impl fmt::Debug for Subtable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subtable")
            .field("table", &self.table.id)
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}

fn apply_to_range<F>(buckets: &[BucketCell], timeout: LockTimeout, mut f: F) -> bool
where
    F: FnMut(&mut Bucket) -> bool,
{
    for cell in buckets {
        let Some(mut guard) = lock_cell(cell, timeout) else {
            return false;
        };
        if !f(&mut guard) {
            return false;
        }
    }
    true
}
