//! Scheduler Module
//!
//! The boundary between the cache and whatever executes its background work.
//! Posting never runs work on the caller's thread; a refused post is
//! reported back so the manager can retry it on its own schedule.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;

/// A unit of background work.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

// == Scheduler ==
/// Executes posted work eventually, or refuses it.
pub trait Scheduler: Send + Sync {
    /// Queues `work`. Returns false if the work was not accepted.
    fn post(&self, work: Work) -> bool;
}

impl<F> Scheduler for F
where
    F: Fn(Work) -> bool + Send + Sync,
{
    fn post(&self, work: Work) -> bool {
        self(work)
    }
}

// == Tokio Scheduler ==
/// Runs work on the tokio blocking pool, refusing posts once
/// `max_in_flight` jobs are queued or running.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: usize,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl TokioScheduler {
    pub fn new(handle: Handle, max_in_flight: usize) -> Self {
        Self {
            handle,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Binds to the runtime of the calling context, if there is one.
    pub fn current(max_in_flight: usize) -> Option<Self> {
        Handle::try_current()
            .ok()
            .map(|handle| Self::new(handle, max_in_flight))
    }

    /// Jobs queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl Scheduler for TokioScheduler {
    fn post(&self, work: Work) -> bool {
        let previous = self.in_flight.fetch_add(1, Ordering::AcqRel);
        let slot = InFlight(Arc::clone(&self.in_flight));
        if previous >= self.max_in_flight {
            return false;
        }
        self.handle.spawn_blocking(move || {
            let _slot = slot;
            work();
        });
        true
    }
}

// == Queue Scheduler ==
/// Holds posted work until [`QueueScheduler::run_pending`] is called.
///
/// Deterministic stand-in for a real executor; can be told to refuse posts.
pub struct QueueScheduler {
    queue: Mutex<VecDeque<Work>>,
    accepting: AtomicBool,
}

impl QueueScheduler {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            accepting: AtomicBool::new(true),
        }
    }

    /// Accept or refuse subsequent posts.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Release);
    }

    /// Jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Runs queued work on the calling thread, including work posted while
    /// running, until the queue is empty. Returns the number of jobs run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.queue.lock().pop_front();
            let Some(work) = next else {
                return ran;
            };
            work();
            ran += 1;
        }
    }
}

impl Default for QueueScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for QueueScheduler {
    fn post(&self, work: Work) -> bool {
        if !self.accepting.load(Ordering::Acquire) {
            return false;
        }
        self.queue.lock().push_back(work);
        true
    }
}

impl std::fmt::Debug for QueueScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueScheduler")
            .field("pending", &self.pending())
            .field("accepting", &self.accepting.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_queue_scheduler_runs_in_order() {
        let scheduler = QueueScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            assert!(scheduler.post(Box::new(move || log.lock().push(i))));
        }
        assert_eq!(scheduler.pending(), 3);
        assert!(log.lock().is_empty());

        assert_eq!(scheduler.run_pending(), 3);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_queue_scheduler_refuses_when_closed() {
        let scheduler = QueueScheduler::new();
        scheduler.set_accepting(false);
        assert!(!scheduler.post(Box::new(|| {})));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_closure_scheduler() {
        let refuse = |_work: Work| false;
        assert!(!refuse.post(Box::new(|| {})));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_scheduler_limits_in_flight() {
        let scheduler = TokioScheduler::current(1).unwrap();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        assert!(scheduler.post(Box::new(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        })));
        assert!(!scheduler.post(Box::new(|| {})));

        release_tx.send(()).unwrap();
        for _ in 0..500 {
            if scheduler.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(scheduler.in_flight(), 0);
        assert!(scheduler.post(Box::new(|| {})));
    }
}
