//! Per-cache accounting.
//!
//! A [`Metadata`] record lives behind its cache's metadata lock. Every change
//! to a cache's usage goes through it, which keeps the global counter in the
//! manager equal to the sum of the registered caches' usages.

/// Usage target meaning "no shrink requested".
pub const UNLIMITED: u64 = u64::MAX;

// == Metadata ==
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Bytes charged for the cache object itself
    pub fixed_size: u64,
    /// Allocation of the primary table
    pub table_size: u64,
    /// Allocation reserved for an in-flight migration's destination table
    pub auxiliary_table_size: u64,
    /// Bytes of stored entries
    pub entry_usage: u64,
    /// Usage a running free-memory task is working towards
    pub usage_target: u64,
    /// A MigrateTask is queued, deferred or running
    pub migrating: bool,
    /// A FreeMemoryTask is queued, deferred or running
    pub freeing_memory: bool,
    /// The cache was deregistered; its usage has been returned wholesale
    pub shutdown: bool,
    /// Tasks dispatched for this cache that have not finished
    pub outstanding_tasks: u64,
}

impl Metadata {
    pub fn new(fixed_size: u64, table_size: u64) -> Self {
        Self {
            fixed_size,
            table_size,
            auxiliary_table_size: 0,
            entry_usage: 0,
            usage_target: UNLIMITED,
            migrating: false,
            freeing_memory: false,
            shutdown: false,
            outstanding_tasks: 0,
        }
    }

    /// Total bytes charged to the cache.
    pub fn usage(&self) -> u64 {
        self.fixed_size + self.table_size + self.auxiliary_table_size + self.entry_usage
    }

    /// Smallest usage freeing memory can reach: everything but the entries.
    pub fn floor(&self) -> u64 {
        self.fixed_size + self.table_size + self.auxiliary_table_size
    }

    /// Claims the migration slot. Returns false if one is already taken.
    pub fn begin_migrating(&mut self) -> bool {
        if self.shutdown || self.migrating {
            return false;
        }
        self.migrating = true;
        self.outstanding_tasks += 1;
        true
    }

    pub fn end_migrating(&mut self) {
        if self.migrating {
            self.migrating = false;
            self.outstanding_tasks = self.outstanding_tasks.saturating_sub(1);
        }
    }

    /// Claims the free-memory slot. Returns false if one is already taken.
    pub fn begin_freeing_memory(&mut self) -> bool {
        if self.shutdown || self.freeing_memory {
            return false;
        }
        self.freeing_memory = true;
        self.outstanding_tasks += 1;
        true
    }

    pub fn end_freeing_memory(&mut self) {
        if self.freeing_memory {
            self.freeing_memory = false;
            self.outstanding_tasks = self.outstanding_tasks.saturating_sub(1);
            self.usage_target = UNLIMITED;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_sums_components() {
        let mut metadata = Metadata::new(100, 1000);
        metadata.entry_usage = 50;
        metadata.auxiliary_table_size = 4000;
        assert_eq!(metadata.usage(), 5150);
        assert_eq!(metadata.floor(), 5100);
    }

    #[test]
    fn test_task_slots_are_exclusive() {
        let mut metadata = Metadata::new(0, 0);
        assert!(metadata.begin_migrating());
        assert!(!metadata.begin_migrating());
        assert!(metadata.begin_freeing_memory());
        assert_eq!(metadata.outstanding_tasks, 2);

        metadata.end_migrating();
        metadata.end_migrating();
        assert_eq!(metadata.outstanding_tasks, 1);
        assert!(metadata.begin_migrating());
    }

    #[test]
    fn test_shutdown_refuses_tasks() {
        let mut metadata = Metadata::new(0, 0);
        metadata.shutdown = true;
        assert!(!metadata.begin_migrating());
        assert!(!metadata.begin_freeing_memory());
        assert_eq!(metadata.outstanding_tasks, 0);
    }

    #[test]
    fn test_end_freeing_resets_target() {
        let mut metadata = Metadata::new(0, 0);
        metadata.begin_freeing_memory();
        metadata.usage_target = 10;
        metadata.end_freeing_memory();
        assert_eq!(metadata.usage_target, UNLIMITED);
    }
}
