//! Eligibility checks against live state, reconciliation and funnel stats.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::config::OffloadConfig;
use crate::domains::asset::repository::AssetRepository;
use crate::domains::asset::resolver::AttachmentResolver;
use crate::domains::asset::types::{Asset, AssetFlag, AssetId, Inconsistency, MigrationStatus};
use crate::domains::core::cache::LookupCache;
use crate::domains::core::file_storage_service::{FileInfo, FileStorageService};
use crate::domains::core::media_types::{guess_mime_type, ImageFormat};
use crate::errors::DomainResult;
use super::rules;
use super::types::{Candidate, CheckOutcome, EligibilityStats, Ineligible};

const OPTIMIZATION_STATS_KEY: &str = "optimization";
const MIGRATION_STATS_KEY: &str = "migration";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Optimization,
    Migration,
}

pub struct EligibilityService {
    config: Arc<OffloadConfig>,
    assets: Arc<dyn AssetRepository>,
    storage: Arc<dyn FileStorageService>,
    resolver: Arc<AttachmentResolver>,
    stats_cache: Arc<dyn LookupCache<EligibilityStats>>,
}

impl EligibilityService {
    pub fn new(
        config: Arc<OffloadConfig>,
        assets: Arc<dyn AssetRepository>,
        storage: Arc<dyn FileStorageService>,
        resolver: Arc<AttachmentResolver>,
        stats_cache: Arc<dyn LookupCache<EligibilityStats>>,
    ) -> Self {
        Self {
            config,
            assets,
            storage,
            resolver,
            stats_cache,
        }
    }

    pub fn config(&self) -> &OffloadConfig {
        &self.config
    }

    /// Applies the reconciliation rule and returns the status to act on.
    ///
    /// A remote URL without the flag drops the cached URL and is reported as
    /// inconsistent (treated as migrated). A flag without a remote URL is cleared
    /// and reported as not migrated.
    pub async fn reconcile(&self, asset: &Asset) -> DomainResult<MigrationStatus> {
        let url = self.resolver.public_url(asset);
        let status = MigrationStatus::classify(&asset.flags, self.config.is_remote_url(&url));

        match status {
            MigrationStatus::Inconsistent(Inconsistency::RemoteUrlWithoutFlag) => {
                log::warn!(
                    "Asset {} resolves to remote URL {} without a migrated flag; resetting cached URL",
                    asset.id, url
                );
                self.resolver.delete_flags(asset.id, &[AssetFlag::PublicUrl]).await?;
                Ok(status)
            }
            MigrationStatus::Inconsistent(Inconsistency::FlagWithoutRemoteUrl) => {
                log::warn!(
                    "Asset {} is flagged as migrated but resolves to {}; clearing migration flags",
                    asset.id, url
                );
                self.resolver
                    .delete_flags(asset.id, &[
                        AssetFlag::Migrated,
                        AssetFlag::BunnyUrl,
                        AssetFlag::MigrationDate,
                        AssetFlag::PublicUrl,
                    ])
                    .await?;
                Ok(MigrationStatus::NotMigrated)
            }
            other => Ok(other),
        }
    }

    pub async fn check_optimization(&self, path: &str) -> DomainResult<CheckOutcome> {
        let known = self.resolver.resolve(path).await?;
        self.check(Task::Optimization, path, known).await
    }

    pub async fn check_migration(&self, path: &str) -> DomainResult<CheckOutcome> {
        let known = self.resolver.resolve(path).await?;
        self.check(Task::Migration, path, known).await
    }

    /// Checks a batch with one resolver round-trip. Results keep input order.
    pub async fn check_optimization_batch(&self, paths: &[String]) -> DomainResult<Vec<(String, CheckOutcome)>> {
        self.check_batch(Task::Optimization, paths).await
    }

    pub async fn check_migration_batch(&self, paths: &[String]) -> DomainResult<Vec<(String, CheckOutcome)>> {
        self.check_batch(Task::Migration, paths).await
    }

    async fn check_batch(&self, task: Task, paths: &[String]) -> DomainResult<Vec<(String, CheckOutcome)>> {
        let resolved: HashMap<String, AssetId> = self.resolver.resolve_batch(paths).await?;
        let mut outcomes = Vec::with_capacity(paths.len());
        for path in paths {
            let outcome = self.check(task, path, resolved.get(path).copied()).await?;
            outcomes.push((path.clone(), outcome));
        }
        Ok(outcomes)
    }

    async fn check(&self, task: Task, path: &str, asset_id: Option<AssetId>) -> DomainResult<CheckOutcome> {
        let Some(relative_path) = self.resolver.normalize_path(path) else {
            return Ok(Err(Ineligible::NotLocal));
        };

        let info = match self.storage.file_info(&relative_path).await {
            Ok(info) => info,
            Err(e) => {
                log::warn!("Could not inspect {}: {}", relative_path, e);
                return Ok(Err(Ineligible::Unreadable));
            }
        };
        if !info.exists {
            return Ok(Err(Ineligible::Missing));
        }

        let asset = match asset_id {
            Some(id) => self.resolver.load_asset(id).await?,
            None => None,
        };
        let Some(asset) = asset else {
            return Ok(Err(Ineligible::NoOwningAsset));
        };

        let mime_type = self.mime_type_for(&relative_path, &asset);
        let verdict = match task {
            Task::Optimization => {
                let on_remote = self.config.is_remote_url(&self.resolver.public_url(&asset));
                rules::check_optimization(&info, &mime_type, asset.flags.optimized, on_remote, self.config.max_file_size_kb)
            }
            Task::Migration => {
                let status = self.reconcile(&asset).await?;
                rules::check_migration(&info, &mime_type, status, self.config.max_file_size_kb)
            }
        };

        Ok(verdict.map(|_| Candidate {
            path: path.to_string(),
            relative_path,
            mime_type,
            info,
            asset,
        }))
    }

    fn mime_type_for(&self, relative_path: &str, asset: &Asset) -> String {
        guess_mime_type(&self.storage.get_absolute_path(relative_path))
            .or_else(|| guess_mime_type(Path::new(&asset.file_path)))
            .unwrap_or_else(|| asset.mime_type.clone())
    }

    pub async fn get_optimization_stats(&self) -> DomainResult<EligibilityStats> {
        self.cached_stats(Task::Optimization).await
    }

    pub async fn get_migration_stats(&self) -> DomainResult<EligibilityStats> {
        self.cached_stats(Task::Migration).await
    }

    pub fn invalidate_stats(&self) {
        self.stats_cache.invalidate_all();
    }

    async fn cached_stats(&self, task: Task) -> DomainResult<EligibilityStats> {
        let key = match task {
            Task::Optimization => OPTIMIZATION_STATS_KEY,
            Task::Migration => MIGRATION_STATS_KEY,
        };
        if let Some(stats) = self.stats_cache.get(key).await {
            return Ok(stats);
        }
        let stats = self.compute_stats(task).await?;
        self.stats_cache.insert(key.to_string(), stats).await;
        Ok(stats)
    }

    /// Walks the image assets in chunks and tallies the eligibility funnel.
    async fn compute_stats(&self, task: Task) -> DomainResult<EligibilityStats> {
        let mut stats = EligibilityStats::default();
        let chunk = self.config.scan_chunk_size.max(1) as i64;
        let mut offset = 0i64;

        loop {
            let summaries = self.assets.list_image_assets(offset, chunk).await?;
            if summaries.is_empty() {
                break;
            }
            offset += summaries.len() as i64;

            for summary in summaries {
                let Some(asset) = self.resolver.load_asset(summary.id).await? else {
                    continue;
                };
                let info = self
                    .storage
                    .file_info(&asset.file_path)
                    .await
                    .unwrap_or_default();
                let on_remote = self.config.is_remote_url(&self.resolver.public_url(&asset));
                let mime_type = self.mime_type_for(&asset.file_path, &asset);
                tally(&mut stats, task, &asset, &info, &mime_type, on_remote, self.config.max_file_size_kb);
            }
        }

        log::debug!("{:?} eligibility stats: {:?}", task, stats);
        Ok(stats)
    }
}

fn tally(
    stats: &mut EligibilityStats,
    task: Task,
    asset: &Asset,
    info: &FileInfo,
    mime_type: &str,
    on_remote: bool,
    max_kb: u64,
) {
    stats.total_images += 1;

    let processed = match task {
        Task::Optimization => asset.flags.optimized,
        Task::Migration => MigrationStatus::classify(&asset.flags, on_remote).is_migrated() || on_remote,
    };
    if processed {
        stats.already_processed += 1;
        return;
    }

    if !info.exists || on_remote {
        return;
    }
    stats.locally_stored += 1;

    let Some(format) = ImageFormat::from_mime(mime_type) else {
        return;
    };
    let (type_ok, size_ok) = match task {
        Task::Optimization => (
            rules::optimization_type_ok(format),
            rules::optimization_size_ok(format, info.size_kb(), max_kb),
        ),
        Task::Migration => (
            rules::migration_type_ok(format),
            rules::migration_size_ok(info.size_kb(), max_kb),
        ),
    };
    if !type_ok {
        return;
    }
    stats.correct_type += 1;

    if size_ok {
        stats.correct_size += 1;
        stats.eligible_total += 1;
    }
}
