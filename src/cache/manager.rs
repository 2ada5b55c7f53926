//! Manager Module
//!
//! Global coordination for a set of caches sharing one memory quota: the
//! registry, memory accounting, the logical clock, the transaction term and
//! background task dispatch.
//!
//! Foreground cache operations touch the manager only through atomics
//! (`tick`, `try_reserve`, `release`, `current_term`). Everything heavier is
//! posted to the [`Scheduler`] and never runs on the caller's thread. A
//! refused post is remembered and re-posted by [`Manager::run_maintenance`].

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::stats::CacheStats;
use super::store::{Cache, CacheType};
use super::table::Table;
use super::transaction::{Transaction, TransactionManager};
use crate::config::{CacheOptions, RebalancePolicy};
use crate::error::{CacheError, Result};
use crate::tasks::{FreeMemoryTask, MigrateTask, Scheduler, Work};

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    /// Keyed by registration order
    caches: BTreeMap<u64, Arc<Cache>>,
}

/// Work whose post was refused, kept for the next maintenance pass.
enum Deferred {
    FreeMemory(Arc<Cache>),
    Migrate(Arc<Cache>, u32),
    Rebalance,
}

#[derive(Debug, Default)]
struct TaskCounters {
    free_memory_runs: AtomicU64,
    migration_runs: AtomicU64,
    rebalances: AtomicU64,
    deferred_posts: AtomicU64,
}

/// Decrements the outstanding task count when posted work finishes or is
/// dropped unrun.
struct Outstanding(Arc<Manager>);

impl Drop for Outstanding {
    fn drop(&mut self) {
        self.0.outstanding_tasks.fetch_sub(1, Ordering::AcqRel);
    }
}

// == Manager Stats ==
/// Point-in-time view of the manager for telemetry.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    /// Configured quota in bytes
    pub quota: u64,
    /// Inserts are refused beyond this many bytes
    pub hard_ceiling: u64,
    /// Bytes charged across all caches
    pub global_usage: u64,
    /// Posted tasks that have not finished
    pub outstanding_tasks: u64,
    /// Refused posts waiting for the next maintenance pass
    pub pending_deferred: usize,
    pub free_memory_runs: u64,
    pub migration_runs: u64,
    pub rebalances: u64,
    /// Posts the scheduler refused
    pub deferred_posts: u64,
    /// Current transaction term
    pub term: u64,
    /// Registered caches, in registration order
    pub caches: Vec<CacheStats>,
}

// == Manager ==
/// Owns the global quota and every registered cache.
pub struct Manager {
    options: CacheOptions,
    scheduler: Arc<dyn Scheduler>,
    this: Weak<Manager>,
    registry: Mutex<Registry>,
    quota: AtomicU64,
    global_usage: AtomicU64,
    clock: AtomicU64,
    transactions: TransactionManager,
    rebalancing: AtomicBool,
    shutting_down: AtomicBool,
    outstanding_tasks: AtomicU64,
    deferred: Mutex<Vec<Deferred>>,
    counters: TaskCounters,
}

impl Manager {
    // == Constructor ==
    /// Creates a manager with `options.cache_size` as its quota. Background
    /// work is posted to `scheduler`.
    pub fn new(options: CacheOptions, scheduler: Arc<dyn Scheduler>) -> Result<Arc<Self>> {
        options.validate()?;
        let quota = options.cache_size;
        info!(quota, policy = ?options.rebalance_policy, "cache manager created");
        Ok(Arc::new_cyclic(|this| Self {
            options,
            scheduler,
            this: this.clone(),
            registry: Mutex::new(Registry::default()),
            quota: AtomicU64::new(quota),
            global_usage: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            transactions: TransactionManager::new(),
            rebalancing: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            outstanding_tasks: AtomicU64::new(0),
            deferred: Mutex::new(Vec::new()),
            counters: TaskCounters::default(),
        }))
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    // == Registry ==
    /// Registers a new cache with a minimum-size table.
    ///
    /// Fails with `QuotaExceeded` if its initial footprint does not fit under
    /// the hard ceiling, `InvalidRequest` for an empty or duplicate name and
    /// `ShuttingDown` once shutdown has begun.
    pub fn create_cache(self: &Arc<Self>, name: impl Into<String>, cache_type: CacheType) -> Result<Arc<Cache>> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CacheError::InvalidRequest("Cache name must not be empty".to_string()));
        }

        let mut registry = self.registry.lock();
        if self.is_shutting_down() {
            return Err(CacheError::ShuttingDown);
        }
        if registry.caches.values().any(|cache| cache.name() == name) {
            return Err(CacheError::InvalidRequest(format!(
                "Cache '{}' is already registered",
                name
            )));
        }

        let log_size = self.options.min_log_size;
        let footprint = Cache::fixed_size() + Table::allocation_size(log_size);
        if !self.try_reserve(footprint) {
            return Err(CacheError::QuotaExceeded(format!(
                "cannot fit {} bytes for cache '{}'",
                footprint, name
            )));
        }
        let table = match Table::new(log_size, &self.options) {
            Ok(table) => Arc::new(table),
            Err(err) => {
                self.release(footprint);
                return Err(err);
            }
        };

        registry.next_id += 1;
        let id = registry.next_id;
        let cache = Cache::new(id, name, cache_type, Arc::clone(self), table);
        registry.caches.insert(id, Arc::clone(&cache));
        info!(cache = %cache.name(), id, ?cache_type, log_size, "cache registered");
        Ok(cache)
    }

    /// Looks up a registered cache by name.
    pub fn find_cache(&self, name: &str) -> Option<Arc<Cache>> {
        self.registry
            .lock()
            .caches
            .values()
            .find(|cache| cache.name() == name)
            .cloned()
    }

    /// Registered caches in registration order.
    pub fn caches(&self) -> Vec<Arc<Cache>> {
        self.registry.lock().caches.values().cloned().collect()
    }

    /// Deregisters a cache and returns its memory to the pool.
    pub fn destroy_cache(&self, name: &str) -> Result<()> {
        let cache = {
            let mut registry = self.registry.lock();
            let id = registry
                .caches
                .iter()
                .find(|(_, cache)| cache.name() == name)
                .map(|(id, _)| *id);
            id.and_then(|id| registry.caches.remove(&id))
                .ok_or_else(|| CacheError::NotFound(name.to_string()))?
        };

        self.deferred.lock().retain(|item| match item {
            Deferred::FreeMemory(c) | Deferred::Migrate(c, _) => c.id() != cache.id(),
            Deferred::Rebalance => true,
        });
        cache.shutdown();
        info!(cache = %name, "cache destroyed");
        Ok(())
    }

    // == Memory Accounting ==
    /// Configured quota in bytes.
    pub fn quota(&self) -> u64 {
        self.quota.load(Ordering::Acquire)
    }

    /// Changes the quota. Requests a rebalance if usage now exceeds it.
    pub fn set_quota(&self, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Err(CacheError::InvalidRequest("Quota must be positive".to_string()));
        }
        {
            let _registry = self.registry.lock();
            let previous = self.quota.swap(bytes, Ordering::AcqRel);
            info!(previous, quota = bytes, "quota changed");
        }
        if self.is_over_quota() {
            self.request_rebalance();
        }
        Ok(())
    }

    /// Bytes charged across all caches.
    pub fn global_usage(&self) -> u64 {
        self.global_usage.load(Ordering::Acquire)
    }

    /// Usage beyond which reservations are refused.
    pub fn hard_ceiling(&self) -> u64 {
        (self.quota() as f64 * self.options.hard_quota_ratio) as u64
    }

    pub fn is_over_quota(&self) -> bool {
        self.global_usage() > self.quota()
    }

    /// Charges `bytes` unless that would pass the hard ceiling.
    pub(crate) fn try_reserve(&self, bytes: u64) -> bool {
        let ceiling = self.hard_ceiling();
        self.global_usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |usage| {
                usage.checked_add(bytes).filter(|next| *next <= ceiling)
            })
            .is_ok()
    }

    /// Charges `bytes` unconditionally.
    pub(crate) fn force_reserve(&self, bytes: u64) {
        self.global_usage.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn release(&self, bytes: u64) {
        let _ = self
            .global_usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |usage| {
                Some(usage.saturating_sub(bytes))
            });
    }

    // == Clock / Transactions ==
    /// Advances the logical clock used to stamp entry accesses.
    pub fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// The current transaction term.
    pub fn current_term(&self) -> u64 {
        self.transactions.term()
    }

    /// Opens a transaction handle. Read-only transactions cannot banish.
    pub fn begin_transaction(self: &Arc<Self>, read_only: bool) -> Transaction {
        Transaction::begin(Arc::clone(self), read_only)
    }

    // == Dispatch ==
    /// Dispatches a FreeMemoryTask shrinking `cache` towards `usage_target`.
    /// Returns false if one is already pending or the post was refused.
    pub fn dispatch_free_memory(&self, cache: &Arc<Cache>, usage_target: u64) -> bool {
        if self.is_shutting_down() || !cache.begin_free_memory(usage_target) {
            return false;
        }
        self.post_free_memory(Arc::clone(cache))
    }

    /// Dispatches a MigrateTask resizing `cache` to `log_size`, or resuming
    /// its unfinished migration. Returns false if one is already pending,
    /// the growth does not fit, or the post was refused.
    pub fn dispatch_migration(&self, cache: &Arc<Cache>, log_size: u32) -> bool {
        if self.is_shutting_down() || !cache.begin_migration(log_size) {
            return false;
        }
        debug!(cache = %cache.name(), log_size, "migration dispatched");
        self.post_migration(Arc::clone(cache), log_size)
    }

    /// Posts a rebalance unless one is already pending.
    pub fn request_rebalance(&self) {
        if self.is_shutting_down() || self.rebalancing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.post_rebalance();
    }

    fn post_free_memory(&self, cache: Arc<Cache>) -> bool {
        let task = FreeMemoryTask::new(Arc::clone(&cache));
        self.post(Deferred::FreeMemory(cache), Box::new(move || {
            task.run();
        }))
    }

    fn post_migration(&self, cache: Arc<Cache>, log_size: u32) -> bool {
        let task = MigrateTask::new(Arc::clone(&cache), log_size);
        self.post(Deferred::Migrate(cache, log_size), Box::new(move || {
            task.run();
        }))
    }

    fn post_rebalance(&self) -> bool {
        let Some(manager) = self.this.upgrade() else {
            return false;
        };
        self.post(Deferred::Rebalance, Box::new(move || {
            manager.rebalance();
            manager.rebalancing.store(false, Ordering::Release);
        }))
    }

    fn post(&self, retry: Deferred, work: Work) -> bool {
        let Some(manager) = self.this.upgrade() else {
            self.cancel(retry);
            return false;
        };
        if self.is_shutting_down() {
            self.cancel(retry);
            return false;
        }

        self.outstanding_tasks.fetch_add(1, Ordering::AcqRel);
        let outstanding = Outstanding(manager);
        let accepted = self.scheduler.post(Box::new(move || {
            let _outstanding = outstanding;
            work();
        }));
        if !accepted {
            self.counters.deferred_posts.fetch_add(1, Ordering::Relaxed);
            warn!(task = retry.label(), "scheduler refused task, deferring");
            self.deferred.lock().push(retry);
        }
        accepted
    }

    fn repost(&self, item: Deferred) -> bool {
        match item {
            Deferred::FreeMemory(cache) => self.post_free_memory(cache),
            Deferred::Migrate(cache, log_size) => self.post_migration(cache, log_size),
            Deferred::Rebalance => self.post_rebalance(),
        }
    }

    /// Releases the bookkeeping of work that will never run.
    fn cancel(&self, item: Deferred) {
        match item {
            Deferred::FreeMemory(cache) => cache.end_free_memory(),
            Deferred::Migrate(cache, _) => {
                if cache.is_migrating() {
                    cache.end_migration();
                } else {
                    cache.abandon_migration();
                }
            }
            Deferred::Rebalance => self.rebalancing.store(false, Ordering::Release),
        }
    }

    // == Rebalancing ==
    /// Spreads a quota breach over the caches by dispatching FreeMemoryTasks.
    ///
    /// Frees down to `quota * free_memory_target_ratio`, taking from caches
    /// in policy order; ties keep registration order. Also checks every
    /// cache for a pending resize. Returns the number of tasks dispatched.
    pub fn rebalance(&self) -> usize {
        self.counters.rebalances.fetch_add(1, Ordering::Relaxed);
        let mut dispatched = 0;

        let quota = self.quota();
        let usage = self.global_usage();
        if usage > quota {
            let target = (quota as f64 * self.options.free_memory_target_ratio) as u64;
            let mut excess = usage.saturating_sub(target);

            let mut candidates: Vec<(Arc<Cache>, u64, f64)> = self
                .caches()
                .into_iter()
                .map(|cache| {
                    let stats = cache.stats();
                    let hit_rate = stats.hit_rate();
                    (cache, stats.usage, hit_rate)
                })
                .collect();
            match self.options.rebalance_policy {
                RebalancePolicy::HighestUsage => {
                    candidates.sort_by_key(|(_, usage, _)| Reverse(*usage));
                }
                RebalancePolicy::LowestHitRate => {
                    candidates.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(CmpOrdering::Equal));
                }
            }

            for (cache, cache_usage, _) in candidates {
                if excess == 0 {
                    break;
                }
                let share = cache.reclaimable().min(excess);
                if share == 0 {
                    continue;
                }
                excess -= share;
                if self.dispatch_free_memory(&cache, cache_usage.saturating_sub(share)) {
                    dispatched += 1;
                }
            }
            info!(usage, quota, target, dispatched, "rebalanced memory");
        }

        dispatched + self.check_migrations()
    }

    /// Dispatches a MigrateTask for every cache whose table wants another
    /// size or whose migration was left unfinished.
    pub fn check_migrations(&self) -> usize {
        let mut dispatched = 0;
        for cache in self.caches() {
            let table = cache.table();
            let target = match table.auxiliary() {
                Some(auxiliary) => auxiliary.log_size(),
                None => table.ideal_size(),
            };
            if target != table.log_size() && self.dispatch_migration(&cache, target) {
                dispatched += 1;
            }
        }
        dispatched
    }

    /// One maintenance pass: re-post deferred work, rebalance if over quota,
    /// dispatch pending resizes.
    pub fn run_maintenance(&self) {
        if self.is_shutting_down() {
            return;
        }
        let deferred = mem::take(&mut *self.deferred.lock());
        let retried = deferred.len();
        let accepted = deferred
            .into_iter()
            .map(|item| self.repost(item))
            .filter(|accepted| *accepted)
            .count();
        if retried > 0 {
            debug!(retried, accepted, "re-posted deferred tasks");
        }

        if self.is_over_quota() {
            self.request_rebalance();
        }
        self.check_migrations();
    }

    // == Shutdown ==
    /// Two-phase shutdown: stop dispatching and registering, wait up to
    /// `drain` for outstanding tasks, then deregister every cache and disable
    /// its tables.
    pub fn shutdown(&self, drain: Duration) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("cache manager shutting down");

        let deferred = mem::take(&mut *self.deferred.lock());
        for item in deferred {
            self.cancel(item);
        }

        let deadline = Instant::now() + drain;
        while self.outstanding_tasks() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        let remaining = self.outstanding_tasks();
        if remaining > 0 {
            warn!(remaining, "shutdown proceeding with tasks still outstanding");
        }

        let caches = mem::take(&mut self.registry.lock().caches);
        for cache in caches.into_values() {
            cache.shutdown();
        }
        info!(usage = self.global_usage(), "cache manager shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Posted tasks that have not finished.
    pub fn outstanding_tasks(&self) -> u64 {
        self.outstanding_tasks.load(Ordering::Acquire)
    }

    pub(crate) fn record_free_memory_run(&self) {
        self.counters.free_memory_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_migration_run(&self) {
        self.counters.migration_runs.fetch_add(1, Ordering::Relaxed);
    }

    // == Stats ==
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            quota: self.quota(),
            hard_ceiling: self.hard_ceiling(),
            global_usage: self.global_usage(),
            outstanding_tasks: self.outstanding_tasks(),
            pending_deferred: self.deferred.lock().len(),
            free_memory_runs: self.counters.free_memory_runs.load(Ordering::Relaxed),
            migration_runs: self.counters.migration_runs.load(Ordering::Relaxed),
            rebalances: self.counters.rebalances.load(Ordering::Relaxed),
            deferred_posts: self.counters.deferred_posts.load(Ordering::Relaxed),
            term: self.current_term(),
            caches: self.caches().iter().map(|cache| cache.stats()).collect(),
        }
    }
}

impl Deferred {
    fn label(&self) -> &'static str {
        match self {
            Deferred::FreeMemory(_) => "free_memory",
            Deferred::Migrate(..) => "migrate",
            Deferred::Rebalance => "rebalance",
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("quota", &self.quota())
            .field("global_usage", &self.global_usage())
            .field("caches", &self.registry.lock().caches.len())
            .field("outstanding_tasks", &self.outstanding_tasks())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
