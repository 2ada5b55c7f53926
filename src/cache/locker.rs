//! Bucket Locker Module
//!
//! Scope-bound bucket guards. A guard owns a reference to the table that
//! served the bucket, so the bucket stays valid for as long as the guard is
//! held even if the table is retired by a migration in the meantime.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use super::bucket::Bucket;
use super::table::Table;

/// Shared, individually lockable bucket storage.
pub type BucketCell = Arc<Mutex<Bucket>>;

// == Lock Timeout ==
/// How long to wait for a bucket lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTimeout {
    /// Wait until the lock is acquired
    Unbounded,
    /// Give up after the duration; zero tries exactly once
    Bounded(Duration),
}

impl LockTimeout {
    /// Try once, never wait.
    pub const IMMEDIATE: LockTimeout = LockTimeout::Bounded(Duration::ZERO);
}

pub(crate) fn lock_cell(
    cell: &BucketCell,
    timeout: LockTimeout,
) -> Option<ArcMutexGuard<RawMutex, Bucket>> {
    match timeout {
        LockTimeout::Unbounded => Some(cell.lock_arc()),
        LockTimeout::Bounded(wait) if wait.is_zero() => cell.try_lock_arc(),
        LockTimeout::Bounded(wait) => cell.try_lock_arc_for(wait),
    }
}

// == Bucket Locker ==
/// A locked bucket. Unlocks on drop, on every exit path.
pub struct BucketLocker {
    guard: ArcMutexGuard<RawMutex, Bucket>,
    source: Arc<Table>,
    index: usize,
}

impl BucketLocker {
    pub(crate) fn new(
        guard: ArcMutexGuard<RawMutex, Bucket>,
        source: Arc<Table>,
        index: usize,
    ) -> Self {
        Self {
            guard,
            source,
            index,
        }
    }

    /// The table that owns the locked bucket; the auxiliary table when the
    /// lookup was redirected by a migration.
    pub fn source(&self) -> &Arc<Table> {
        &self.source
    }

    /// Index of the bucket within [`Self::source`].
    pub fn index(&self) -> usize {
        self.index
    }

    /// True while the guard is held.
    pub fn is_locked(&self) -> bool {
        ArcMutexGuard::mutex(&self.guard).is_locked()
    }

    /// The locked bucket.
    pub fn bucket(&self) -> &Bucket {
        &self.guard
    }

    /// The locked bucket, mutably.
    pub fn bucket_mut(&mut self) -> &mut Bucket {
        &mut self.guard
    }
}

impl Deref for BucketLocker {
    type Target = Bucket;

    fn deref(&self) -> &Bucket {
        &self.guard
    }
}

impl DerefMut for BucketLocker {
    fn deref_mut(&mut self) -> &mut Bucket {
        &mut self.guard
    }
}

impl fmt::Debug for BucketLocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketLocker")
            .field("table", &self.source.id())
            .field("log_size", &self.source.log_size())
            .field("index", &self.index)
            .finish()
    }
}
