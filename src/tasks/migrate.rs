//! Migrate Task
//!
//! Moves a cache from its primary table to a table of another size, one
//! source bucket at a time. For each source bucket, in ascending index order,
//! the task locks the source, then every destination bucket it maps to,
//! moves the entries and banishments across and marks the source migrated.
//! Buckets that cannot be locked in time stay pending; the migration is
//! completed by a later task once every bucket has moved.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::cache::{BucketLocker, Cache, Displaced, LockTimeout, Manager, Subtable, Table};

/// What one run achieved.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    /// Source buckets moved by this run
    pub buckets_migrated: usize,
    /// Source buckets left for a later run
    pub buckets_pending: usize,
    /// Entries moved to the destination table
    pub entries_moved: usize,
    /// Entries dropped on destination overflow or banishment
    pub entries_dropped: usize,
    /// The destination table became the primary table
    pub complete: bool,
}

// == Migrate Task ==
pub struct MigrateTask {
    manager: Arc<Manager>,
    cache: Arc<Cache>,
    log_size: u32,
}

impl MigrateTask {
    pub fn new(cache: Arc<Cache>, log_size: u32) -> Self {
        Self {
            manager: Arc::clone(cache.manager()),
            cache,
            log_size,
        }
    }

    /// Target log size.
    pub fn log_size(&self) -> u32 {
        self.log_size
    }

    pub fn run(self) -> MigrationReport {
        let report = if self.manager.is_shutting_down() {
            MigrationReport::default()
        } else {
            self.migrate()
        };
        self.cache.end_migration();
        self.manager.record_migration_run();
        debug!(
            cache = %self.cache.name(),
            log_size = self.log_size,
            migrated = report.buckets_migrated,
            pending = report.buckets_pending,
            moved = report.entries_moved,
            dropped = report.entries_dropped,
            "migrate task finished"
        );
        report
    }

    fn migrate(&self) -> MigrationReport {
        let table = self.cache.table();
        let auxiliary = match table.auxiliary() {
            Some(auxiliary) => auxiliary,
            None => match self.install_auxiliary(&table) {
                Some(auxiliary) => auxiliary,
                None => {
                    self.cache.abandon_migration();
                    return MigrationReport::default();
                }
            },
        };

        let timeout = LockTimeout::Bounded(self.manager.options().task_lock_timeout);
        let mut report = MigrationReport::default();
        for index in 0..table.size() as usize {
            let Some(mut source) = table.lock_primary(index, timeout) else {
                report.buckets_pending += 1;
                continue;
            };
            if source.is_migrated() {
                continue;
            }
            let Some(subtable) = table.auxiliary_buckets(index) else {
                error!(cache = %self.cache.name(), index, "auxiliary vanished during migration");
                report.buckets_pending += 1;
                break;
            };
            let Some(mut destinations) = subtable.lock_all(timeout) else {
                report.buckets_pending += 1;
                continue;
            };

            self.migrate_bucket(&mut source, &subtable, &mut destinations, &mut report);
            source.mark_migrated();
            report.buckets_migrated += 1;
        }

        if report.buckets_pending == 0 {
            self.cache.complete_migration(&table, auxiliary);
            report.complete = true;
        } else {
            warn!(
                cache = %self.cache.name(),
                pending = report.buckets_pending,
                "migration incomplete, will resume"
            );
        }
        report
    }

    fn install_auxiliary(&self, table: &Arc<Table>) -> Option<Arc<Table>> {
        let auxiliary = match Table::new(self.log_size, self.manager.options()) {
            Ok(auxiliary) => Arc::new(auxiliary),
            Err(err) => {
                error!(cache = %self.cache.name(), %err, "cannot allocate migration target");
                return None;
            }
        };
        match table.set_auxiliary(Some(Arc::clone(&auxiliary))) {
            Ok(_) => Some(auxiliary),
            Err(err) => {
                error!(cache = %self.cache.name(), %err, "cannot install migration target");
                None
            }
        }
    }

    fn migrate_bucket(
        &self,
        source: &mut BucketLocker,
        subtable: &Subtable,
        destinations: &mut [BucketLocker],
        report: &mut MigrationReport,
    ) {
        let term = self.manager.current_term();
        let from = Arc::clone(source.source());
        let to = Arc::clone(subtable.table());

        // banishments move first so that moved entries are checked against them
        if let Some(banish_term) = source.bucket_banish_term() {
            for destination in destinations.iter_mut() {
                destination.banish_all(banish_term);
            }
        }
        for record in source.banish_records() {
            if let Some(position) = subtable.position(record.hash) {
                destinations[position].banish(record.hash, record.term);
            }
        }

        for entry in source.take_entries() {
            from.slot_emptied();
            let Some(position) = subtable.position(entry.hash) else {
                error!(cache = %self.cache.name(), hash = %entry.hash, "entry outside its mapped range");
                self.cache.discard(&entry);
                report.entries_dropped += 1;
                continue;
            };
            let destination = &mut destinations[position];
            if destination.is_banished(entry.hash, term) {
                self.cache.discard(&entry);
                report.entries_dropped += 1;
                continue;
            }
            match destination.insert(entry, self.cache.policy()) {
                Displaced::Nothing => {
                    to.slot_filled();
                    report.entries_moved += 1;
                }
                Displaced::Replaced(old) | Displaced::Evicted(old) => {
                    self.cache.discard(&old);
                    report.entries_moved += 1;
                    report.entries_dropped += 1;
                }
                Displaced::Rejected(entry) => {
                    self.cache.discard(&entry);
                    report.entries_dropped += 1;
                }
            }
        }
    }
}
