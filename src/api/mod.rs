//! API Module
//!
//! HTTP handlers and routing for the read-mostly telemetry surface.
//!
//! # Endpoints
//! - `GET /health` - Health check endpoint
//! - `GET /stats` - Manager and per-cache statistics
//! - `GET /caches/:name` - Statistics of one cache
//! - `PUT /quota` - Change the global memory quota

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
