//! Wiring of the offload service graph.

use sqlx::SqlitePool;
use std::sync::Arc;

use crate::config::OffloadConfig;
use crate::domains::asset::content::{ReferenceRewriter, SqliteContentRepository};
use crate::domains::asset::repository::{AssetRepository, SqliteAssetRepository};
use crate::domains::asset::resolver::AttachmentResolver;
use crate::domains::core::cache::{LookupCache, MokaLookupCache};
use crate::domains::core::file_storage_service::{FileStorageService, LocalFileStorageService};
use crate::domains::eligibility::service::EligibilityService;
use crate::domains::eligibility::types::EligibilityStats;
use crate::domains::migration::remote_storage::RemoteStorage;
use crate::domains::migration::service::Migrator;
use crate::domains::optimization::client::OptimizationApi;
use crate::domains::optimization::service::Optimizer;
use crate::domains::queue::repository::SqliteQueueRepository;
use crate::domains::queue::scanner::QueueScanner;
use crate::domains::queue::service::WorkQueue;
use crate::domains::queue::types::QueueName;
use crate::errors::{DomainError, DomainResult};

const STATS_CACHE_CAPACITY: u64 = 16;

/// Every component of the pipeline, built once over one pool and one config.
#[derive(Clone)]
pub struct OffloadServices {
    pub config: Arc<OffloadConfig>,
    pub pool: SqlitePool,
    pub storage: Arc<dyn FileStorageService>,
    pub assets: Arc<dyn AssetRepository>,
    pub resolver: Arc<AttachmentResolver>,
    pub eligibility: Arc<EligibilityService>,
    pub rewriter: Arc<ReferenceRewriter>,
    pub optimization_queue: WorkQueue,
    pub migration_queue: WorkQueue,
    pub scanner: Arc<QueueScanner>,
    pub optimizer: Arc<Optimizer>,
    pub migrator: Arc<Migrator>,
    pub optimization_api: Arc<dyn OptimizationApi>,
    pub remote_storage: Arc<dyn RemoteStorage>,
}

impl OffloadServices {
    pub fn build(
        pool: SqlitePool,
        config: OffloadConfig,
        optimization_api: Arc<dyn OptimizationApi>,
        remote_storage: Arc<dyn RemoteStorage>,
    ) -> DomainResult<Self> {
        let config = Arc::new(config);
        let storage: Arc<dyn FileStorageService> = Arc::new(
            LocalFileStorageService::new(&config.uploads_dir).map_err(|e| {
                DomainError::File(format!(
                    "Failed to open uploads directory {}: {}",
                    config.uploads_dir.display(),
                    e
                ))
            })?,
        );
        let assets: Arc<dyn AssetRepository> = Arc::new(SqliteAssetRepository::new(pool.clone()));
        let stats_cache: Arc<dyn LookupCache<EligibilityStats>> =
            Arc::new(MokaLookupCache::with_ttl(STATS_CACHE_CAPACITY, config.stats_cache_ttl));

        let resolver = Arc::new(AttachmentResolver::with_default_caches(
            config.clone(),
            assets.clone(),
            storage.clone(),
            stats_cache.clone(),
        ));
        let eligibility = Arc::new(EligibilityService::new(
            config.clone(),
            assets.clone(),
            storage.clone(),
            resolver.clone(),
            stats_cache,
        ));
        let rewriter = Arc::new(ReferenceRewriter::new(Arc::new(SqliteContentRepository::new(pool.clone()))));

        let queue_repo = Arc::new(SqliteQueueRepository::new(pool.clone()));
        let optimization_queue = WorkQueue::new(QueueName::Optimization, queue_repo.clone());
        let migration_queue = WorkQueue::new(QueueName::Migration, queue_repo);
        let scanner = Arc::new(QueueScanner::new(assets.clone(), storage.clone(), config.scan_chunk_size));

        let optimizer = Arc::new(Optimizer::new(
            config.clone(),
            optimization_api.clone(),
            eligibility.clone(),
            resolver.clone(),
            rewriter.clone(),
            migration_queue.clone(),
        ));
        let migrator = Arc::new(Migrator::new(
            config.clone(),
            remote_storage.clone(),
            eligibility.clone(),
            resolver.clone(),
            rewriter.clone(),
        ));

        Ok(Self {
            config,
            pool,
            storage,
            assets,
            resolver,
            eligibility,
            rewriter,
            optimization_queue,
            migration_queue,
            scanner,
            optimizer,
            migrator,
            optimization_api,
            remote_storage,
        })
    }

    pub fn queue(&self, name: QueueName) -> &WorkQueue {
        match name {
            QueueName::Optimization => &self.optimization_queue,
            QueueName::Migration => &self.migration_queue,
        }
    }
}
