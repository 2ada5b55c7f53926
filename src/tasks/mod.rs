//! Background Tasks Module
//!
//! Bounded units of background work and the scheduler boundary they are
//! posted through.
//!
//! # Tasks
//! - FreeMemoryTask: evicts entries until a cache is back under its target
//! - MigrateTask: moves a cache to a table of another size
//! - Maintenance: periodic rebalancing and retry of refused posts

mod free_memory;
mod maintenance;
mod migrate;
mod scheduler;

pub use free_memory::{FreeMemoryReport, FreeMemoryTask};
pub use maintenance::spawn_maintenance_task;
pub use migrate::{MigrateTask, MigrationReport};
pub use scheduler::{QueueScheduler, Scheduler, TokioScheduler, Work};
