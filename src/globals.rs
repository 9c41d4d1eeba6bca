//! Process-wide service registry.

use lazy_static::lazy_static;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::config::OffloadConfig;
use crate::db_migration;
use crate::domains::migration::remote_storage::BunnyStorageClient;
use crate::domains::offload::{OffloadOrchestrator, OffloadServices, OffloadWorker};
use crate::domains::optimization::client::HttpOptimizationApi;
use crate::errors::{DomainError, DomainResult};

const POOL_MAX_CONNECTIONS: u32 = 5;

lazy_static! {
    static ref INIT_MUTEX: tokio::sync::Mutex<()> = tokio::sync::Mutex::new(());
    static ref INITIALIZED: AtomicBool = AtomicBool::new(false);

    static ref DB_POOL: Mutex<Option<SqlitePool>> = Mutex::new(None);
    static ref SERVICES: Mutex<Option<OffloadServices>> = Mutex::new(None);
    static ref ORCHESTRATOR: Mutex<Option<Arc<OffloadOrchestrator>>> = Mutex::new(None);
    static ref WORKER_SHUTDOWN: Mutex<Option<oneshot::Sender<()>>> = Mutex::new(None);
}

fn poisoned(name: &str) -> DomainError {
    DomainError::Internal(format!("{} lock poisoned", name))
}

pub fn get_db_pool() -> DomainResult<SqlitePool> {
    DB_POOL.lock().map_err(|_| poisoned("DB_POOL"))?.clone().ok_or_else(|| DomainError::Internal("Database pool not initialized".to_string()))
}

pub fn get_services() -> DomainResult<OffloadServices> {
    SERVICES.lock().map_err(|_| poisoned("SERVICES"))?.clone().ok_or_else(|| DomainError::Internal("Offload services not initialized".to_string()))
}

pub fn get_orchestrator() -> DomainResult<Arc<OffloadOrchestrator>> {
    ORCHESTRATOR.lock().map_err(|_| poisoned("ORCHESTRATOR"))?.clone().ok_or_else(|| DomainError::Internal("Offload orchestrator not initialized".to_string()))
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

/// Opens the database, applies migrations and builds the service graph.
/// Subsequent calls are no-ops.
pub async fn initialize(db_url: &str, config: OffloadConfig) -> DomainResult<()> {
    let _guard = INIT_MUTEX.lock().await;
    if INITIALIZED.load(Ordering::Acquire) {
        return Ok(());
    }

    let result = initialize_internal(db_url, config).await;
    if result.is_ok() {
        INITIALIZED.store(true, Ordering::Release);
    }
    result
}

async fn initialize_internal(db_url: &str, config: OffloadConfig) -> DomainResult<()> {
    if std::env::var("RUST_LOG").is_err() {
        #[cfg(debug_assertions)]
        std::env::set_var("RUST_LOG", "debug");
        #[cfg(not(debug_assertions))]
        std::env::set_var("RUST_LOG", "info");
    }
    let _ = env_logger::try_init();

    log::info!("Starting offload core initialization");
    log::debug!("Database URL: {}", db_url);
    log::debug!("Uploads directory: {}", config.uploads_dir.display());

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(POOL_MAX_CONNECTIONS)
        .connect(db_url)
        .await
        .map_err(|e| DomainError::Internal(format!("Database connection failed: {}", e)))?;
    db_migration::run_migrations(&pool).await?;

    let optimization_api = Arc::new(HttpOptimizationApi::from_config(&config));
    let remote_storage = Arc::new(BunnyStorageClient::from_config(&config));
    if config.optimization_credentials().is_err() {
        log::warn!("Optimization API key not set; optimization batches will be refused");
    }
    if config.storage_credentials().is_err() {
        log::warn!("Storage zone or access key not set; migration batches will be refused");
    }

    let services = OffloadServices::build(pool.clone(), config, optimization_api, remote_storage)?;
    let orchestrator = Arc::new(OffloadOrchestrator::new(services.clone()));

    *DB_POOL.lock().map_err(|_| poisoned("DB_POOL"))? = Some(pool);
    *SERVICES.lock().map_err(|_| poisoned("SERVICES"))? = Some(services);
    *ORCHESTRATOR.lock().map_err(|_| poisoned("ORCHESTRATOR"))? = Some(orchestrator);

    log::info!("Offload core initialized");
    Ok(())
}

/// Spawns the background worker on the current runtime. Returns false if one is already running.
pub fn start_worker() -> DomainResult<bool> {
    let mut shutdown = WORKER_SHUTDOWN.lock().map_err(|_| poisoned("WORKER_SHUTDOWN"))?;
    if shutdown.is_some() {
        return Ok(false);
    }

    let orchestrator = get_orchestrator()?;
    let interval = orchestrator.services().config.worker_interval;
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        OffloadWorker::new(orchestrator, interval)
            .with_shutdown_signal(rx)
            .start()
            .await;
    });
    *shutdown = Some(tx);
    Ok(true)
}

/// Signals the background worker to stop after its current tick.
pub fn stop_worker() -> DomainResult<()> {
    if let Some(tx) = WORKER_SHUTDOWN.lock().map_err(|_| poisoned("WORKER_SHUTDOWN"))?.take() {
        let _ = tx.send(());
        log::info!("Offload worker shutdown requested");
    }
    Ok(())
}
