//! Maintenance Task
//!
//! Periodically drives [`Manager::run_maintenance`]: re-posting refused work,
//! rebalancing memory and dispatching pending resizes.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::Manager;

/// Spawns a background task that runs a maintenance pass every
/// `interval_secs` seconds.
///
/// The pass itself only posts work to the manager's scheduler, so it is
/// cheap enough to run on the async runtime.
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during graceful shutdown.
///
/// # Example
/// ```ignore
/// let handle = spawn_maintenance_task(manager.clone(), 1);
/// // Later, during shutdown:
/// handle.abort();
/// ```
pub fn spawn_maintenance_task(manager: Arc<Manager>, interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(interval_secs.max(1));

    tokio::spawn(async move {
        info!(
            "Starting cache maintenance task with interval of {} seconds",
            interval.as_secs()
        );

        loop {
            tokio::time::sleep(interval).await;

            if manager.is_shutting_down() {
                debug!("Maintenance: manager shutting down, stopping");
                break;
            }
            manager.run_maintenance();

            let stats = manager.stats();
            debug!(
                usage = stats.global_usage,
                quota = stats.quota,
                outstanding = stats.outstanding_tasks,
                deferred = stats.pending_deferred,
                "Maintenance pass complete"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheType;
    use crate::config::CacheOptions;
    use crate::tasks::QueueScheduler;
    use tokio_test::{assert_pending, assert_ready_err, assert_ready_ok, task};

    #[tokio::test]
    async fn test_maintenance_reposts_deferred_work() {
        let scheduler = Arc::new(QueueScheduler::new());
        let manager = Manager::new(CacheOptions::default(), scheduler.clone()).unwrap();
        manager.create_cache("documents", CacheType::Plain).unwrap();

        scheduler.set_accepting(false);
        manager.request_rebalance();
        assert_eq!(manager.stats().pending_deferred, 1);
        scheduler.set_accepting(true);

        let handle = spawn_maintenance_task(manager.clone(), 1);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(manager.stats().pending_deferred, 0);
        assert_eq!(scheduler.pending(), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn test_maintenance_stops_on_shutdown() {
        let manager = Manager::new(CacheOptions::default(), Arc::new(QueueScheduler::new())).unwrap();
        let mut handle = task::spawn(spawn_maintenance_task(manager.clone(), 1));
        assert_pending!(handle.poll());

        manager.shutdown(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(handle.is_woken());
        assert_ready_ok!(handle.poll());
    }

    #[tokio::test]
    async fn test_maintenance_task_can_be_aborted() {
        let manager = Manager::new(CacheOptions::default(), Arc::new(QueueScheduler::new())).unwrap();
        let handle = spawn_maintenance_task(manager, 1);

        // Abort immediately
        handle.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut handle = task::spawn(handle);
        let err = assert_ready_err!(handle.poll());
        assert!(err.is_cancelled());
    }
}
