//! API Handlers
//!
//! HTTP request handlers for each telemetry endpoint.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};

use crate::cache::Manager;
use crate::error::{CacheError, Result};
use crate::models::{
    CacheStatsResponse, HealthResponse, QuotaResponse, SetQuotaRequest, StatsResponse,
};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// The cache manager being observed
    pub manager: Arc<Manager>,
}

impl AppState {
    /// Creates a new AppState for the given manager.
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }
}

/// Handler for GET /stats
///
/// Returns manager-wide statistics and a snapshot of every cache.
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(state.manager.stats().into())
}

/// Handler for GET /caches/:name
///
/// Returns the statistics of one registered cache.
pub async fn cache_stats_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<CacheStatsResponse>> {
    let cache = state
        .manager
        .find_cache(&name)
        .ok_or(CacheError::NotFound(name))?;

    Ok(Json(cache.stats().into()))
}

/// Handler for PUT /quota
///
/// Changes the global memory quota; a rebalance is requested if usage now
/// exceeds it.
pub async fn set_quota_handler(
    State(state): State<AppState>,
    Json(req): Json<SetQuotaRequest>,
) -> Result<Json<QuotaResponse>> {
    // Validate request
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidRequest(error_msg));
    }
    if state.manager.is_shutting_down() {
        return Err(CacheError::ShuttingDown);
    }

    state.manager.set_quota(req.bytes)?;

    Ok(Json(QuotaResponse::new(
        state.manager.quota(),
        state.manager.global_usage(),
    )))
}

/// Handler for GET /health
///
/// Returns health status of the server.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    if state.manager.is_shutting_down() {
        Json(HealthResponse::shutting_down())
    } else {
        Json(HealthResponse::healthy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheType;
    use crate::config::CacheOptions;
    use crate::tasks::QueueScheduler;

    fn test_state() -> AppState {
        let manager = Manager::new(CacheOptions::default(), Arc::new(QueueScheduler::new())).unwrap();
        manager.create_cache("documents", CacheType::Transactional).unwrap();
        AppState::new(manager)
    }

    #[tokio::test]
    async fn test_cache_stats_handler() {
        let state = test_state();
        let cache = state.manager.find_cache("documents").unwrap();
        cache.insert("k", "v").unwrap();
        cache.lookup(b"k");

        let response = cache_stats_handler(State(state), Path("documents".to_string()))
            .await
            .unwrap();
        assert_eq!(response.stats.hits, 1);
        assert_eq!(response.stats.entries, 1);
        assert_eq!(response.hit_rate, 1.0);
    }

    #[tokio::test]
    async fn test_cache_stats_unknown_cache() {
        let result = cache_stats_handler(State(test_state()), Path("edges".to_string())).await;
        assert!(matches!(result, Err(CacheError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stats_handler() {
        let state = test_state();
        let response = stats_handler(State(state.clone())).await;
        assert_eq!(response.caches.len(), 1);
        assert_eq!(response.global_usage, state.manager.global_usage());
    }

    #[tokio::test]
    async fn test_set_quota_handler() {
        let state = test_state();
        let response = set_quota_handler(State(state.clone()), Json(SetQuotaRequest { bytes: 1 << 20 }))
            .await
            .unwrap();
        assert_eq!(response.quota, 1 << 20);
        assert_eq!(state.manager.quota(), 1 << 20);

        let result = set_quota_handler(State(state), Json(SetQuotaRequest { bytes: 0 })).await;
        assert!(matches!(result, Err(CacheError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_health_handler() {
        let state = test_state();
        let response = health_handler(State(state.clone())).await;
        assert_eq!(response.status, "healthy");

        state.manager.shutdown(std::time::Duration::from_millis(10));
        let response = health_handler(State(state)).await;
        assert_eq!(response.status, "shutting_down");
    }
}
