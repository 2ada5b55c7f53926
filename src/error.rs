//! Error types for the cache subsystem
//!
//! Provides unified error handling using thiserror.
//!
//! Misses, lock timeouts and quota exhaustion are *not* errors: foreground
//! operations fold them into "not found" / "not cached". The variants below
//! cover input validation, registration failures and invariant violations.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

// == Cache Error Enum ==
/// Unified error type for the cache subsystem.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Requested cache is not registered
    #[error("Cache not found: {0}")]
    NotFound(String),

    /// Invalid request data (oversized key or value, bad quota)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Not enough quota left to register a cache
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Options failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A second auxiliary table was installed while a migration was in flight
    #[error("Auxiliary conflict: table with log size {current} already migrating to log size {existing}")]
    AuxiliaryConflict {
        /// Log size of the table being migrated
        current: u32,
        /// Log size of the auxiliary already installed
        existing: u32,
    },

    /// An auxiliary table of the same size as the table it would serve
    #[error("Auxiliary table for log size {0} must differ in size")]
    AuxiliarySizeMismatch(u32),

    /// A table log size outside the supported bounds
    #[error("Log size {0} out of range")]
    LogSizeOutOfRange(u32),

    /// The manager no longer accepts registrations or tasks
    #[error("Manager is shutting down")]
    ShuttingDown,
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::NotFound(_) => StatusCode::NOT_FOUND,
            CacheError::InvalidRequest(_) | CacheError::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
            CacheError::QuotaExceeded(_) | CacheError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CacheError::AuxiliaryConflict { .. }
            | CacheError::AuxiliarySizeMismatch(_)
            | CacheError::LogSizeOutOfRange(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse::new(self.to_string()));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache subsystem.
pub type Result<T> = std::result::Result<T, CacheError>;
