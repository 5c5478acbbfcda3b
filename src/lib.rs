//! Skywatch -- multi-source telemetry anomaly detection.
//!
//! This crate provides the core library for per-source baselines, z-score
//! anomaly detection with severity escalation, cross-source divergence,
//! feed freshness, idempotent signal emission, and the coverage geometry
//! used for tracked satellites.

pub mod api;
pub mod config;
pub mod detect;
pub mod freshness;
pub mod geometry;
pub mod ingest;
pub mod observation;
pub mod reconcile;
pub mod scheduler;
pub mod signal;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::SkywatchConfig;

/// Open the configured database, creating its directory when needed.
pub fn open_store(config: &SkywatchConfig) -> Result<storage::Pool> {
    let path = &config.storage.db_path;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create data directory {}", dir.display()))?;
    }
    let path_str = path
        .to_str()
        .with_context(|| format!("database path is not valid UTF-8: {}", path.display()))?;
    storage::open_pool(path_str)
}

/// Start the Skywatch daemon: API server plus one scan loop per domain.
pub async fn serve(config: Arc<SkywatchConfig>, bind: &str) -> Result<()> {
    // 1. Initialize Storage
    tracing::info!(db_path = %config.storage.db_path.display(), "Initializing database");
    let pool = open_store(&config)?;

    // 2. Start per-domain scan loops (background tasks)
    let state = api::state::AppState::new(pool, config.clone());
    let scheduler = scheduler::Scheduler::from_config(&config)?;
    let _loops = scheduler::spawn_scan_loops(&scheduler, &state.engine);

    // 3. Start API Server
    let addr: std::net::SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", bind))?;
    let app = api::router(state);

    tracing::info!(%addr, "Skywatch listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
