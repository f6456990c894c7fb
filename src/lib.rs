//! taskpilot -- durable cron jobs for a self-hosted deployment platform.
//!
//! This crate provides the cron expression parser and next-run calculator, the
//! SQLite-backed job store, the dispatcher that invokes due jobs, and the
//! admin API in front of them.

pub mod api;
pub mod config;
pub mod cron;
pub mod scheduler;
pub mod storage;

use anyhow::{Context, Result};
use config::{Config, LoggingConfig};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` overrides the configured level.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Start the taskpilot daemon: admin API server and dispatcher.
pub async fn serve(config: Config) -> Result<()> {
    // 1. Initialize Storage
    let db_path = &config.storage.db_path;
    tracing::info!(%db_path, "Initializing database");
    let pool = storage::open_pool(db_path)?;
    let store = scheduler::JobStore::new(pool);

    // 2. Start Dispatcher (background task)
    let handler = scheduler::HttpHandler::new(&config.handler)
        .context("failed to build handler client")?;
    let dispatcher = scheduler::Dispatcher::new(store.clone(), Arc::new(handler), config.dispatcher.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher_task = tokio::spawn(dispatcher.run(shutdown_rx));

    // 3. Start API Server
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.server.bind))?;
    let app = api::router(api::state::AppState { store });

    tracing::info!(%addr, "taskpilot listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("shutdown requested");
        })
        .await?;

    // In-flight occurrences are not awaited; the reaper fails them on the next start.
    let _ = shutdown_tx.send(true);
    dispatcher_task.await?;
    Ok(())
}
