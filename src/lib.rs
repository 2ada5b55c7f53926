//! txcache - A memory-budgeted, transaction-aware object cache
//!
//! Many named caches share one global memory quota. Tables resize online,
//! background work is posted to a pluggable scheduler, and write
//! transactions banish keys so readers never see a superseded value.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod tasks;

pub use api::AppState;
pub use cache::{Cache, CacheType, Finding, Manager, Transaction};
pub use config::{CacheOptions, Config};
pub use error::{CacheError, Result};
pub use tasks::{spawn_maintenance_task, QueueScheduler, Scheduler, TokioScheduler};
