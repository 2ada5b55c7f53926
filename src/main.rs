//! txcache - telemetry host
//!
//! Runs a cache manager with the configured caches registered and serves its
//! statistics over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use txcache::api::create_router;
use txcache::{spawn_maintenance_task, AppState, CacheType, Config, Manager, TokioScheduler};

/// Background jobs allowed in flight before posts are refused.
const MAX_IN_FLIGHT_TASKS: usize = 64;

/// How long shutdown waits for outstanding tasks.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Main entry point for the cache telemetry host.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Create the manager on a tokio-backed scheduler
/// 4. Register the configured caches
/// 5. Start background maintenance task
/// 6. Start HTTP server on configured port
/// 7. On SIGINT/SIGTERM, stop serving and shut the manager down
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber with env filter
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "txcache=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting txcache");

    // Load configuration from environment variables
    let config = Config::from_env();
    info!(
        "Configuration loaded: quota={} bytes, caches={:?}, port={}, maintenance_interval={}s",
        config.options.cache_size,
        config.cache_names,
        config.server_port,
        config.maintenance_interval
    );

    let scheduler = TokioScheduler::current(MAX_IN_FLIGHT_TASKS)
        .context("no tokio runtime for the task scheduler")?;
    let manager = Manager::new(config.options.clone(), Arc::new(scheduler))
        .context("invalid cache options")?;

    for name in &config.cache_names {
        manager
            .create_cache(name.as_str(), CacheType::Transactional)
            .with_context(|| format!("failed to register cache '{}'", name))?;
    }

    // Start background maintenance task
    let maintenance_handle = spawn_maintenance_task(manager.clone(), config.maintenance_interval);
    info!("Background maintenance task started");

    // Create router with all endpoints
    let app = create_router(AppState::new(manager.clone()));

    // Bind to configured port
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(maintenance_handle))
        .await
        .context("server error")?;

    // Drain tasks off the runtime threads
    let draining = manager.clone();
    tokio::task::spawn_blocking(move || draining.shutdown(SHUTDOWN_DRAIN))
        .await
        .context("manager shutdown panicked")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
///
/// On shutdown signal, aborts the maintenance task and allows graceful shutdown.
async fn shutdown_signal(maintenance_handle: tokio::task::JoinHandle<()>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Abort the maintenance task
    maintenance_handle.abort();
    warn!("Maintenance task aborted");
}
