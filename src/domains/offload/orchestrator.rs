//! Drives the queues: one batch per tick, retry accounting and eviction.

use serde::Serialize;
use tokio::sync::Mutex;

use crate::domains::core::file_storage_service::file_name;
use crate::domains::eligibility::types::EligibilityStats;
use crate::domains::optimization::types::AccountStatus;
use crate::domains::queue::service::WorkQueue;
use crate::domains::queue::types::{BatchOutcome, BatchProcessor, EligibilityCheck, QueueName};
use crate::errors::DomainResult;
use super::services::OffloadServices;

/// What started a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickTrigger {
    /// Periodic worker; honours the auto-optimize/auto-migrate switches.
    Scheduled,
    /// User action; always runs.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickStatus {
    Processed,
    /// Nothing queued and nothing eligible found by a scan.
    Empty,
    /// Scheduled tick while the automatic switch is off.
    Disabled,
    NotConfigured,
    /// Another batch of the same queue is still running.
    Busy,
    /// The whole batch failed; every path stays queued.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub queue: QueueName,
    pub status: TickStatus,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub ineligible: usize,
    /// Queued paths whose file disappeared before processing.
    pub dropped_missing: Vec<String>,
    /// Paths removed after reaching the retry cap.
    pub evicted: Vec<String>,
    pub messages: Vec<String>,
    pub remaining: usize,
    pub eligible_total: Option<u64>,
}

impl TickReport {
    fn new(queue: QueueName, status: TickStatus) -> Self {
        Self {
            queue,
            status,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            ineligible: 0,
            dropped_missing: Vec::new(),
            evicted: Vec::new(),
            messages: Vec::new(),
            remaining: 0,
            eligible_total: None,
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }
}

/// Outcome of probing one remote service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionCheck {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionReport {
    pub optimization: ConnectionCheck,
    pub storage: ConnectionCheck,
}

pub struct OffloadOrchestrator {
    services: OffloadServices,
    optimization_lock: Mutex<()>,
    migration_lock: Mutex<()>,
}

impl OffloadOrchestrator {
    pub fn new(services: OffloadServices) -> Self {
        Self {
            services,
            optimization_lock: Mutex::new(()),
            migration_lock: Mutex::new(()),
        }
    }

    pub fn services(&self) -> &OffloadServices {
        &self.services
    }

    pub async fn run_optimization_tick(&self, trigger: TickTrigger) -> DomainResult<TickReport> {
        self.run_tick(QueueName::Optimization, trigger).await
    }

    pub async fn run_migration_tick(&self, trigger: TickTrigger) -> DomainResult<TickReport> {
        self.run_tick(QueueName::Migration, trigger).await
    }

    fn lock_for(&self, name: QueueName) -> &Mutex<()> {
        match name {
            QueueName::Optimization => &self.optimization_lock,
            QueueName::Migration => &self.migration_lock,
        }
    }

    fn processor(&self, name: QueueName) -> &dyn BatchProcessor {
        match name {
            QueueName::Optimization => &*self.services.optimizer,
            QueueName::Migration => &*self.services.migrator,
        }
    }

    fn eligibility(&self, name: QueueName) -> &dyn EligibilityCheck {
        match name {
            QueueName::Optimization => &*self.services.optimizer,
            QueueName::Migration => &*self.services.migrator,
        }
    }

    fn batch_size(&self, name: QueueName) -> usize {
        match name {
            QueueName::Optimization => self.services.config.optimization_batch_size,
            QueueName::Migration => self.services.config.migration_batch_size,
        }
    }

    fn enabled(&self, name: QueueName) -> bool {
        match name {
            QueueName::Optimization => self.services.config.auto_optimize,
            QueueName::Migration => self.services.config.auto_migrate,
        }
    }

    fn credentials_error(&self, name: QueueName) -> Option<String> {
        let config = &self.services.config;
        let result = match name {
            QueueName::Optimization => config.optimization_credentials().map(|_| ()),
            QueueName::Migration => config.storage_credentials().map(|_| ()),
        };
        result.err().map(|e| e.to_string())
    }

    async fn stats(&self, name: QueueName) -> DomainResult<EligibilityStats> {
        match name {
            QueueName::Optimization => self.services.eligibility.get_optimization_stats().await,
            QueueName::Migration => self.services.eligibility.get_migration_stats().await,
        }
    }

    async fn run_tick(&self, name: QueueName, trigger: TickTrigger) -> DomainResult<TickReport> {
        let Ok(_guard) = self.lock_for(name).try_lock() else {
            log::info!("{} batch already running, skipping tick", name);
            return Ok(TickReport::new(name, TickStatus::Busy).with_message("A batch is already running"));
        };

        if trigger == TickTrigger::Scheduled && !self.enabled(name) {
            return Ok(TickReport::new(name, TickStatus::Disabled));
        }
        if let Some(message) = self.credentials_error(name) {
            log::warn!("{} tick refused: {}", name, message);
            return Ok(TickReport::new(name, TickStatus::NotConfigured).with_message(message));
        }

        let queue = self.services.queue(name);
        if queue.size().await? == 0 {
            let added = self.services.scanner.scan(queue, self.eligibility(name)).await?;
            if added == 0 {
                let mut report = TickReport::new(name, TickStatus::Empty);
                report.eligible_total = Some(self.stats(name).await?.eligible_total);
                return Ok(report);
            }
        }

        let mut report = TickReport::new(name, TickStatus::Processed);
        report.dropped_missing = self.drop_missing(queue, self.batch_size(name)).await?;

        let processed = queue.process(self.processor(name), self.batch_size(name)).await?;
        report.attempted = processed.batch.len();

        match processed.outcome {
            BatchOutcome::Processed(batch) => {
                report.succeeded = batch.succeeded.len();
                report.failed = batch.failed.len();
                report.ineligible = batch.ineligible.len();
                report.messages.extend(batch.messages);
                for (path, _) in &batch.failed {
                    if let Some(evicted) = self.record_failure(queue, path).await? {
                        report.evicted.push(evicted);
                    }
                }
            }
            BatchOutcome::Failed { reason } => {
                report.status = TickStatus::Failed;
                report.failed = processed.batch.len();
                report.messages.push(reason);
                for entry in &processed.batch {
                    if let Some(evicted) = self.record_failure(queue, &entry.path).await? {
                        report.evicted.push(evicted);
                    }
                }
            }
            BatchOutcome::NotConfigured { message } => {
                report.status = TickStatus::NotConfigured;
                report.messages.push(message);
            }
        }

        report.remaining = queue.size().await?;
        report.eligible_total = Some(self.stats(name).await?.eligible_total);
        log::info!(
            "{} tick: {} attempted, {} succeeded, {} failed, {} evicted, {} remaining",
            name,
            report.attempted,
            report.succeeded,
            report.failed,
            report.evicted.len(),
            report.remaining
        );
        Ok(report)
    }

    /// Removes head-of-queue paths whose file no longer exists.
    async fn drop_missing(&self, queue: &WorkQueue, batch_size: usize) -> DomainResult<Vec<String>> {
        let mut dropped = Vec::new();
        for entry in queue.get_entries(batch_size.max(1)).await? {
            let exists = match self.services.resolver.normalize_path(&entry.path) {
                Some(relative) => self
                    .services
                    .storage
                    .file_info(&relative)
                    .await
                    .map(|info| info.exists)
                    .unwrap_or(false),
                None => false,
            };
            if !exists {
                queue.remove(&entry.path).await?;
                log::info!("Dropped missing file from {} queue: {}", queue.name(), file_name(&entry.path));
                dropped.push(entry.path);
            }
        }
        Ok(dropped)
    }

    /// Counts a failed attempt; evicts the path once it reaches the retry cap.
    async fn record_failure(&self, queue: &WorkQueue, path: &str) -> DomainResult<Option<String>> {
        let attempts = queue.retry_count(path).await?;
        if attempts >= self.services.config.max_retries {
            queue.remove(path).await?;
            log::warn!(
                "Evicted {} from {} queue after {} failed attempts",
                file_name(path),
                queue.name(),
                attempts
            );
            return Ok(Some(path.to_string()));
        }
        log::debug!("{} failed attempt {} of {}", file_name(path), attempts, self.services.config.max_retries);
        Ok(None)
    }

    /// Clears the queue and scans the asset population again.
    pub async fn reinitialize_queue(&self, name: QueueName) -> DomainResult<usize> {
        let _guard = self.lock_for(name).lock().await;
        let queue = self.services.queue(name);
        queue.clear().await?;
        self.services.eligibility.invalidate_stats();
        self.services.scanner.scan(queue, self.eligibility(name)).await
    }

    pub async fn test_connections(&self) -> ConnectionReport {
        let optimization = match self.services.config.optimization_credentials() {
            Ok(key) => match self.services.optimization_api.account_status(key).await {
                Ok(AccountStatus { credits, plan, .. }) => ConnectionCheck {
                    ok: true,
                    message: format!(
                        "Optimization API connection successful (credits: {}, plan: {})",
                        credits.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string()),
                        plan.unwrap_or_else(|| "unknown".to_string())
                    ),
                },
                Err(e) => ConnectionCheck { ok: false, message: e.to_string() },
            },
            Err(e) => ConnectionCheck { ok: false, message: e.to_string() },
        };

        let storage = match self.services.migrator.test_connection().await {
            Ok(()) => ConnectionCheck {
                ok: true,
                message: "Storage API connection successful".to_string(),
            },
            Err(e) => ConnectionCheck { ok: false, message: e.to_string() },
        };

        ConnectionReport { optimization, storage }
    }
}
