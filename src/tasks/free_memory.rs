//! Free Memory Task
//!
//! Evicts entries from one cache until its usage is back under the target
//! the manager set for it, or the scan budget runs out. Busy buckets are
//! skipped, never waited on beyond the task lock timeout.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::cache::{Cache, LockTimeout, Manager, Table};

/// What one run achieved.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FreeMemoryReport {
    /// Buckets visited
    pub visited: usize,
    /// Buckets skipped because they could not be locked in time
    pub busy: usize,
    /// Entries evicted
    pub evicted: usize,
    /// Usage ended at or below the target
    pub target_reached: bool,
}

// == Free Memory Task ==
pub struct FreeMemoryTask {
    manager: Arc<Manager>,
    cache: Arc<Cache>,
}

impl FreeMemoryTask {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self {
            manager: Arc::clone(cache.manager()),
            cache,
        }
    }

    /// Runs once. Afterwards, if the table is oversized for what is left in
    /// it, a shrinking migration is dispatched.
    pub fn run(self) -> FreeMemoryReport {
        let report = if self.manager.is_shutting_down() {
            FreeMemoryReport::default()
        } else {
            self.free_memory()
        };
        self.cache.end_free_memory();
        self.manager.record_free_memory_run();
        debug!(
            cache = %self.cache.name(),
            visited = report.visited,
            busy = report.busy,
            evicted = report.evicted,
            target_reached = report.target_reached,
            "free memory task finished"
        );

        let table = self.cache.table();
        if table.auxiliary().is_none() && table.ideal_size() < table.log_size() {
            self.manager.dispatch_migration(&self.cache, table.ideal_size());
        }
        report
    }

    fn free_memory(&self) -> FreeMemoryReport {
        let options = self.manager.options();
        let timeout = LockTimeout::Bounded(options.task_lock_timeout);
        let budget = options.free_memory_scan_budget;
        let target = self.cache.usage_target();

        let table = self.cache.table();
        let size = table.size() as usize;
        let start = self.cache.free_memory_cursor().load(Ordering::Relaxed) % size;

        let mut report = FreeMemoryReport::default();
        let mut fruitless = 0;
        while report.visited < budget && fruitless < size {
            if self.cache.usage() <= target {
                break;
            }
            let index = (start + report.visited) % size;
            report.visited += 1;

            if self.evict_at(&table, index, target, timeout, &mut report) {
                fruitless = 0;
            } else {
                fruitless += 1;
            }
        }

        self.cache
            .free_memory_cursor()
            .store((start + report.visited) % size, Ordering::Relaxed);
        report.target_reached = self.cache.usage() <= target;
        report
    }

    /// Evicts one entry from bucket `index`. A bucket that was already
    /// migrated is served by its auxiliary buckets, and each of those gives
    /// up one entry instead. Returns true if anything was evicted.
    fn evict_at(
        &self,
        table: &Arc<Table>,
        index: usize,
        target: u64,
        timeout: LockTimeout,
        report: &mut FreeMemoryReport,
    ) -> bool {
        let Some(mut bucket) = table.lock_primary(index, timeout) else {
            report.busy += 1;
            return false;
        };
        if !bucket.is_migrated() {
            let evicted = self.cache.evict_from(&mut bucket);
            report.evicted += usize::from(evicted);
            return evicted;
        }
        drop(bucket);

        let Some(subtable) = table.auxiliary_buckets(index) else {
            return false;
        };
        let mut evicted = false;
        for position in subtable.start()..subtable.start() + subtable.len() {
            if self.cache.usage() <= target {
                break;
            }
            let Some(mut bucket) = subtable.table().lock_primary(position, timeout) else {
                report.busy += 1;
                continue;
            };
            if self.cache.evict_from(&mut bucket) {
                report.evicted += 1;
                evicted = true;
            }
        }
        evicted
    }
}
