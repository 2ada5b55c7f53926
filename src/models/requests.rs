//! Request DTOs for the telemetry API
//!
//! Defines the structure of incoming HTTP request bodies.

use serde::Deserialize;

/// Request body for the quota operation (PUT /quota)
///
/// # Fields
/// - `bytes`: The new global memory quota
#[derive(Debug, Clone, Deserialize)]
pub struct SetQuotaRequest {
    /// New quota in bytes
    pub bytes: u64,
}

impl SetQuotaRequest {
    /// Validates the request data
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if self.bytes == 0 {
            return Some("Quota must be positive".to_string());
        }
        None
    }
}
