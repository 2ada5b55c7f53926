//! Response DTOs for the telemetry API
//!
//! Defines the structure of outgoing HTTP response bodies.

use serde::Serialize;

use crate::cache::{CacheStats, ManagerStats};

/// Response body for one cache (GET /caches/:name)
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsResponse {
    #[serde(flatten)]
    pub stats: CacheStats,
    /// Hit rate (hits / (hits + misses))
    pub hit_rate: f64,
}

impl From<CacheStats> for CacheStatsResponse {
    fn from(stats: CacheStats) -> Self {
        let hit_rate = stats.hit_rate();
        Self { stats, hit_rate }
    }
}

/// Response body for the stats endpoint (GET /stats)
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    /// Global quota in bytes
    pub quota: u64,
    /// Usage beyond which inserts are refused
    pub hard_ceiling: u64,
    /// Bytes charged across all caches
    pub global_usage: u64,
    /// Background tasks posted and not yet finished
    pub outstanding_tasks: u64,
    /// Refused posts awaiting retry
    pub pending_deferred: usize,
    pub free_memory_runs: u64,
    pub migration_runs: u64,
    pub rebalances: u64,
    pub deferred_posts: u64,
    /// Current transaction term
    pub term: u64,
    /// Per-cache statistics in registration order
    pub caches: Vec<CacheStatsResponse>,
}

impl From<ManagerStats> for StatsResponse {
    fn from(stats: ManagerStats) -> Self {
        Self {
            quota: stats.quota,
            hard_ceiling: stats.hard_ceiling,
            global_usage: stats.global_usage,
            outstanding_tasks: stats.outstanding_tasks,
            pending_deferred: stats.pending_deferred,
            free_memory_runs: stats.free_memory_runs,
            migration_runs: stats.migration_runs,
            rebalances: stats.rebalances,
            deferred_posts: stats.deferred_posts,
            term: stats.term,
            caches: stats.caches.into_iter().map(Into::into).collect(),
        }
    }
}

/// Response body for the quota operation (PUT /quota)
#[derive(Debug, Clone, Serialize)]
pub struct QuotaResponse {
    /// Success message
    pub message: String,
    /// The quota now in effect
    pub quota: u64,
    /// Usage at the time of the change
    pub global_usage: u64,
}

impl QuotaResponse {
    /// Creates a new QuotaResponse
    pub fn new(quota: u64, global_usage: u64) -> Self {
        Self {
            message: format!("Quota set to {} bytes", quota),
            quota,
            global_usage,
        }
    }
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Health status (e.g., "healthy")
    pub status: String,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Reported once the manager has begun shutting down
    pub fn shutting_down() -> Self {
        Self {
            status: "shutting_down".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Error response body for all error conditions
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong
    pub error: String,
}

impl ErrorResponse {
    /// Creates a new ErrorResponse
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
