//! TalentPitch Feed Engine
//!
//! An in-memory feed recommendation service.
//!
//! # Architecture
//!
//! - **Catalog**: immutable in-memory snapshot of items, flows, creators and
//!   interactions, reloadable without a restart
//! - **Engine**: contextual bandits plus the slot-pattern assembler
//! - **Tracker**: write-buffered activity events with a periodic drain
//! - **API Server**: REST endpoints for the front door
//!
//! # Graceful Shutdown
//!
//! The engine handles SIGTERM and SIGINT, ensuring:
//! - In-flight requests complete
//! - Buffered activity is drained one last time
//! - Database connections are closed cleanly

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pitchfeed::api::{self, AppState};
use pitchfeed::catalog::CatalogHandle;
use pitchfeed::config::Config;
use pitchfeed::database::Database;
use pitchfeed::error::Result;
use pitchfeed::recommendation::FeedEngine;
use pitchfeed::tracking::ActivityTracker;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with structured logging
    init_tracing();

    info!("═══════════════════════════════════════════════════════════════");
    info!("  TalentPitch Feed Engine v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");
    info!("  Components:");
    info!("    • Catalog snapshot (reloadable)");
    info!("    • Recommendation engine (3 contextual bandits)");
    info!("    • Activity tracker + periodic drain");
    info!("    • REST API server");
    info!("═══════════════════════════════════════════════════════════════");

    // Load configuration
    let config = Arc::new(Config::from_env()?);
    info!("✅ Configuration loaded and validated");

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Initialize database connection pool
    let db = Database::new(&config.database).await?;
    info!("✅ Database connection pool established");

    // Connect the activity tracker (degrades to a no-op when the cache is
    // down; feeds keep serving)
    let tracker = ActivityTracker::connect(&config.cache).await;
    if tracker.is_enabled() {
        info!("✅ Activity tracker connected");
    }

    // Load the initial catalog snapshot. A failure here is not fatal:
    // handlers retry inline and return 503 until a load succeeds.
    let catalog = CatalogHandle::new();
    match catalog.get_or_load(&db, &config.engine).await {
        Ok(snapshot) => info!(
            "✅ Catalog snapshot loaded ({} items, {} flows)",
            snapshot.items.len(),
            snapshot.flows.len()
        ),
        Err(e) => warn!("⚠️ Initial catalog load failed, will retry inline: {}", e),
    }

    let engine = FeedEngine::new(&config.engine);

    // Create shared state
    let state = Arc::new(AppState {
        config: config.clone(),
        db: db.clone(),
        catalog,
        engine,
        tracker: tracker.clone(),
    });

    // Spawn all services
    let mut handles = Vec::new();

    info!("🔄 Starting activity drain task...");
    handles.push(spawn_activity_drain(state.clone(), shutdown_tx.subscribe()));

    info!("🌐 Starting API server on port {}...", config.api.port);
    handles.push(spawn_api_server(state.clone(), shutdown_tx.subscribe()));

    info!("═══════════════════════════════════════════════════════════════");
    info!("  ✅ All services started successfully");
    info!("  📡 API: http://{}:{}{}", config.api.host, config.api.port, config.api.prefix());
    info!(
        "  🔗 Health: http://{}:{}/health",
        config.api.host, config.api.port
    );
    info!("═══════════════════════════════════════════════════════════════");

    // Wait for shutdown signal or service failure
    tokio::select! {
        _ = shutdown_signal() => {
            info!("📴 Shutdown signal received");
        }
        _ = wait_for_any_failure(&mut handles) => {
            warn!("⚠️ A service failed, initiating shutdown");
        }
    }

    // Graceful shutdown
    info!("🛑 Initiating graceful shutdown...");

    // Signal all services to stop
    let _ = shutdown_tx.send(());

    // Wait for services to finish with timeout
    let shutdown_timeout = Duration::from_secs(30);
    if tokio::time::timeout(shutdown_timeout, shutdown_services(handles))
        .await
        .is_err()
    {
        warn!("⚠️ Shutdown timeout exceeded, forcing exit");
    }

    // Final drain so buffered activity survives the restart
    let flushed = tracker.flush_all_pending(db.pool()).await;
    if flushed > 0 {
        info!("Final drain flushed {} activities", flushed);
    }
    db.close().await;

    info!("👋 Feed engine stopped gracefully");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Default log levels
        EnvFilter::new("pitchfeed=debug,tower_http=debug,sqlx=warn,info")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .init();
}

/// Spawn the periodic activity drain
fn spawn_activity_drain(
    state: Arc<AppState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.flush.interval);

        // Skip first tick (runs immediately otherwise)
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let flushed = state.tracker.flush_all_pending(state.db.pool()).await;
                    if flushed > 0 {
                        info!("Periodic drain flushed {} activities", flushed);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Activity drain shutting down");
                    break;
                }
            }
        }
    })
}

/// Spawn the API server
fn spawn_api_server(
    state: Arc<AppState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = api::start_server(state) => {
                if let Err(e) = result {
                    error!("API server error: {:?}", e);
                }
            }
            _ = shutdown_rx.recv() => {
                info!("API server shutting down");
            }
        }
    })
}

/// Wait for any task to fail
async fn wait_for_any_failure(handles: &mut [tokio::task::JoinHandle<()>]) {
    loop {
        for handle in handles.iter_mut() {
            if handle.is_finished() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Wait for all services to complete shutdown
async fn shutdown_services(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
