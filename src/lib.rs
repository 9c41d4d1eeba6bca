//! Offload core: decides which uploaded images to optimize and migrate,
//! queues them durably, and runs the optimize and remote-storage pipelines.

pub mod config;
pub mod db_migration;
pub mod domains;
pub mod errors;
pub mod globals;

pub use config::OffloadConfig;
pub use domains::offload::{OffloadOrchestrator, OffloadServices, OffloadWorker, TickReport, TickStatus, TickTrigger};
pub use domains::queue::types::QueueName;
pub use errors::{DomainError, DomainResult, ServiceError, ServiceResult};

/// Initialize the library with the given database URL and configuration.
/// This function must be called before any other function in the library.
pub async fn initialize(db_url: &str, config: OffloadConfig) -> DomainResult<()> {
    globals::initialize(db_url, config).await
}

/// Runs one manual tick of `queue` on the initialized services.
pub async fn run_tick(queue: QueueName) -> DomainResult<TickReport> {
    let orchestrator = globals::get_orchestrator()?;
    match queue {
        QueueName::Optimization => orchestrator.run_optimization_tick(TickTrigger::Manual).await,
        QueueName::Migration => orchestrator.run_migration_tick(TickTrigger::Manual).await,
    }
}
