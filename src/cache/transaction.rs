//! Transaction Module
//!
//! Ties cache visibility to write-transaction boundaries.
//!
//! The [`TransactionManager`] keeps a global *term* that advances when the
//! number of open write transactions goes from zero to one and again from one
//! to zero, so the term is odd exactly while writes are open. A banishment
//! record carries the term in which it was made and suppresses hits only
//! while the global term still equals it. A record therefore stays active
//! until its own transaction and every write transaction overlapping it have
//! finalized, then goes stale on its own.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::hash::BucketHash;
use super::manager::Manager;
use super::store::Cache;

#[derive(Debug, Default)]
struct TermState {
    open_reads: u64,
    open_writes: u64,
    term: u64,
}

// == Transaction Manager ==
/// Counts open transactions and owns the global term.
#[derive(Debug, Default)]
pub struct TransactionManager {
    state: Mutex<TermState>,
    /// Mirror of `state.term` for lock-free reads
    term: AtomicU64,
    next_id: AtomicU64,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transaction; returns its id and the term it runs in.
    pub fn begin(&self, read_only: bool) -> (u64, u64) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state.lock();
        if read_only {
            state.open_reads += 1;
        } else {
            state.open_writes += 1;
            if state.open_writes == 1 {
                state.term += 1;
                self.term.store(state.term, Ordering::Release);
            }
        }
        (id, state.term)
    }

    /// Unregisters a transaction started with the same `read_only` flag.
    pub fn end(&self, read_only: bool) {
        let mut state = self.state.lock();
        if read_only {
            state.open_reads = state.open_reads.saturating_sub(1);
        } else if state.open_writes > 0 {
            state.open_writes -= 1;
            if state.open_writes == 0 {
                state.term += 1;
                self.term.store(state.term, Ordering::Release);
            }
        }
    }

    /// The current term.
    pub fn term(&self) -> u64 {
        self.term.load(Ordering::Acquire)
    }

    /// Open read-only transactions.
    pub fn open_reads(&self) -> u64 {
        self.state.lock().open_reads
    }

    /// Open write transactions.
    pub fn open_writes(&self) -> u64 {
        self.state.lock().open_writes
    }
}

// == Transaction ==
/// One database transaction's handle on the cache.
///
/// Finalized exactly once, by [`Transaction::commit`], [`Transaction::abort`]
/// or on drop. Commit and abort have the same effect on the cache: the
/// banished keys stay uncached until the term moves on.
pub struct Transaction {
    id: u64,
    read_only: bool,
    term: u64,
    manager: Arc<Manager>,
    banished: HashSet<(u64, BucketHash)>,
    finalized: bool,
}

impl Transaction {
    pub(crate) fn begin(manager: Arc<Manager>, read_only: bool) -> Self {
        let (id, term) = manager.transactions().begin(read_only);
        debug!(transaction = id, read_only, term, "transaction started");
        Self {
            id,
            read_only,
            term,
            manager,
            banished: HashSet::new(),
            finalized: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// The term the transaction started in.
    pub fn term(&self) -> u64 {
        self.term
    }

    /// Distinct keys banished so far.
    pub fn banished_keys(&self) -> usize {
        self.banished.len()
    }

    /// Banishes `key` in `cache` until this transaction and every write
    /// transaction concurrent with it have finalized. Any cached value for
    /// the key is dropped.
    ///
    /// Must be called before the write becomes visible. Idempotent within one
    /// transaction. Returns false for read-only or finalized transactions,
    /// plain caches and caches that were shut down.
    pub fn banish(&mut self, cache: &Cache, key: &[u8]) -> bool {
        if self.read_only || self.finalized {
            return false;
        }
        let hash = BucketHash::of(key);
        if !cache.banish(key) {
            return false;
        }
        self.banished.insert((cache.id(), hash));
        true
    }

    /// Finalizes after a successful write.
    pub fn commit(mut self) {
        self.finalize("committed");
    }

    /// Finalizes after a failed write.
    pub fn abort(mut self) {
        self.finalize("aborted");
    }

    fn finalize(&mut self, outcome: &str) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.manager.transactions().end(self.read_only);
        debug!(
            transaction = self.id,
            outcome,
            banished = self.banished.len(),
            "transaction finalized"
        );
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finalized {
            warn!(transaction = self.id, "transaction dropped without finalizing");
            self.finalize("dropped");
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("read_only", &self.read_only)
            .field("term", &self.term)
            .field("banished", &self.banished.len())
            .field("finalized", &self.finalized)
            .finish()
    }
}
