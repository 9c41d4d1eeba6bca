//! Moves local media to remote storage.
//!
//! Per file: check eligibility, upload the primary file, upload every size
//! variant, mark the asset migrated and rewrite stored references, then delete
//! the local copies. A failed primary upload aborts the file with no state
//! change; a failed variant upload is logged and skipped.

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use crate::config::OffloadConfig;
use crate::domains::asset::content::{ReferenceRewriter, UrlReplacement};
use crate::domains::asset::resolver::{versioned_url, AttachmentResolver};
use crate::domains::asset::types::{flag_bool, Asset, AssetFlag, AssetId, SizeUrl, SizeVariant};
use crate::domains::asset::variants::discover_variants;
use crate::domains::core::file_storage_service::{file_name, join_relative, FileStorageService};
use crate::domains::core::media_types::{guess_mime_type, ImageFormat};
use crate::domains::eligibility::service::EligibilityService;
use crate::domains::queue::types::{BatchOutcome, BatchProcessor, BatchReport, EligibilityCheck};
use crate::errors::{DomainError, DomainResult, ServiceError, ServiceResult};
use super::remote_storage::{RemoteStorage, UploadBody};
use super::sizes::{critical_sizes, generate_sizes};
use super::types::{CompletenessStatus, FileMigration, FixOutcome, MigrationVerification};

const VERSION_TOKEN_LEN: usize = 8;

/// Serializes uploads and keeps a fixed delay between consecutive calls.
pub struct UploadThrottle {
    delay: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl UploadThrottle {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_call: Mutex::new(None),
        }
    }

    pub async fn run<F, T>(&self, call: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let mut last_call = self.last_call.lock().await;
        if let Some(last) = *last_call {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                tokio::time::sleep(self.delay - elapsed).await;
            }
        }
        let result = call.await;
        *last_call = Some(Instant::now());
        result
    }
}

/// One variant file that made it to remote storage.
struct UploadedVariant {
    key: String,
    relative_path: String,
}

#[derive(Default)]
struct VariantUploads {
    uploaded: Vec<UploadedVariant>,
    failed: usize,
}

pub struct Migrator {
    config: Arc<OffloadConfig>,
    remote: Arc<dyn RemoteStorage>,
    eligibility: Arc<EligibilityService>,
    resolver: Arc<AttachmentResolver>,
    rewriter: Arc<ReferenceRewriter>,
    throttle: UploadThrottle,
}

impl Migrator {
    pub fn new(
        config: Arc<OffloadConfig>,
        remote: Arc<dyn RemoteStorage>,
        eligibility: Arc<EligibilityService>,
        resolver: Arc<AttachmentResolver>,
        rewriter: Arc<ReferenceRewriter>,
    ) -> Self {
        let throttle = UploadThrottle::new(config.upload_delay);
        Self {
            config,
            remote,
            eligibility,
            resolver,
            rewriter,
            throttle,
        }
    }

    fn storage(&self) -> &Arc<dyn FileStorageService> {
        self.resolver.storage()
    }

    pub async fn is_eligible_for_migration(&self, path: &str) -> bool {
        match self.eligibility.check_migration(path).await {
            Ok(Ok(_)) => true,
            Ok(Err(reason)) => {
                log::debug!("Not eligible for migration ({}): {}", reason, file_name(path));
                false
            }
            Err(e) => {
                log::error!("Eligibility check failed for {}: {}", path, e);
                false
            }
        }
    }

    /// Migrates up to one batch of paths in order. Never returns an error; see [`BatchOutcome`].
    ///
    /// A file whose upload failed is retried once through [`Migrator::force_migrate_file`].
    pub async fn migrate_batch(&self, paths: &[String]) -> BatchOutcome {
        if let Err(e) = self.config.storage_credentials() {
            return BatchOutcome::NotConfigured { message: e.to_string() };
        }

        let mut report = BatchReport::default();
        for path in paths {
            let name = file_name(path).to_string();
            let outcome = match self.migrate_file(path).await {
                Ok(FileMigration::Failed(reason)) => {
                    log::warn!("Migration of {} failed ({}), retrying with force", name, reason);
                    self.force_migrate_file(path).await
                }
                other => other,
            };

            match outcome {
                Ok(FileMigration::Migrated { remote_url, variants_uploaded, variants_failed }) => {
                    let mut message = format!("Migrated {} to {}", name, remote_url);
                    if variants_uploaded + variants_failed > 0 {
                        message.push_str(&format!(
                            " ({} variant(s) uploaded, {} failed)",
                            variants_uploaded, variants_failed
                        ));
                    }
                    report.succeed(path, message);
                }
                Ok(FileMigration::Ineligible(reason)) => report.skip_ineligible(path, reason),
                Ok(FileMigration::Failed(reason)) => report.fail(path, format!("Failed to migrate {}: {}", name, reason)),
                Err(e) if e.is_configuration() => {
                    log::error!("Remote storage rejected credentials: {}", e);
                    return BatchOutcome::NotConfigured { message: e.to_string() };
                }
                Err(e) => report.fail(path, format!("Failed to migrate {}: {}", name, e)),
            }
        }

        log::info!(
            "Migration batch finished: {} of {} succeeded",
            report.success_count(),
            paths.len()
        );
        BatchOutcome::Processed(report)
    }

    /// Runs the pipeline for one file after the eligibility check.
    ///
    /// Upload failures come back as `FileMigration::Failed`; only rejected
    /// credentials are returned as an error.
    pub async fn migrate_file(&self, path: &str) -> ServiceResult<FileMigration> {
        let candidate = match self.eligibility.check_migration(path).await {
            Ok(Ok(candidate)) => candidate,
            Ok(Err(reason)) => return Ok(FileMigration::Ineligible(reason.to_string())),
            Err(e) => return Ok(FileMigration::Failed(format!("eligibility check failed: {}", e))),
        };
        self.run_pipeline(&candidate.asset, &candidate.relative_path, &candidate.mime_type)
            .await
    }

    /// Clears any migration state and re-runs the whole pipeline, skipping
    /// the eligibility rules.
    pub async fn force_migrate_file(&self, path: &str) -> ServiceResult<FileMigration> {
        let Some(relative_path) = self.resolver.normalize_path(path) else {
            return Ok(FileMigration::Failed(format!("{} is outside the uploads directory", path)));
        };
        let info = self.storage().file_info(&relative_path).await.map_err(DomainError::from)?;
        if !info.exists {
            log::error!("File does not exist: {}", relative_path);
            return Ok(FileMigration::Failed("file does not exist".to_string()));
        }
        let Some(asset_id) = self.resolver.resolve_relative(&relative_path).await? else {
            log::error!("Could not determine owning asset for {}", relative_path);
            return Ok(FileMigration::Failed("no asset owns this file".to_string()));
        };

        self.resolver
            .delete_flags(asset_id, &[
                AssetFlag::Migrated,
                AssetFlag::BunnyUrl,
                AssetFlag::MigrationDate,
                AssetFlag::PublicUrl,
            ])
            .await?;

        let asset = self.resolver.require_asset(asset_id).await?;
        let mime_type = guess_mime_type(&self.storage().get_absolute_path(&relative_path))
            .unwrap_or_else(|| asset.mime_type.clone());
        log::info!(
            "Force migrating {} ({:.2} KB, {})",
            file_name(&relative_path),
            info.size_kb(),
            mime_type
        );
        self.run_pipeline(&asset, &relative_path, &mime_type).await
    }

    async fn run_pipeline(&self, asset: &Asset, relative_path: &str, mime_type: &str) -> ServiceResult<FileMigration> {
        let remote_url = self.config.remote_url(relative_path).ok_or_else(|| {
            ServiceError::Configuration("Storage zone is not configured".to_string())
        })?;

        // UploadPrimary
        if let Err(e) = self
            .upload_local(relative_path, mime_type, self.config.primary_upload_timeout)
            .await
        {
            if e.is_configuration() {
                return Err(e);
            }
            log::error!("Failed to upload {}: {}", file_name(relative_path), e);
            return Ok(FileMigration::Failed(e.to_string()));
        }

        // UploadVariants
        let variants = self.upload_variants(asset, relative_path, mime_type).await;

        // MarkMigrated
        self.mark_migrated(asset, relative_path, &remote_url, &variants).await?;

        // DeleteLocal
        self.delete_local(asset.id, relative_path, &variants).await?;

        self.eligibility.invalidate_stats();
        log::info!(
            "Migrated {} with {} variant(s) ({} failed)",
            file_name(relative_path),
            variants.uploaded.len(),
            variants.failed
        );
        Ok(FileMigration::Migrated {
            remote_url,
            variants_uploaded: variants.uploaded.len(),
            variants_failed: variants.failed,
        })
    }

    /// Uploads a local file under its relative path, streaming large files.
    async fn upload_local(&self, relative_path: &str, content_type: &str, timeout: Duration) -> ServiceResult<()> {
        let size = self.storage().get_file_size(relative_path).await.map_err(DomainError::from)?;
        let body = if size > self.config.large_file_threshold {
            log::debug!("{} is {} bytes, streaming upload", file_name(relative_path), size);
            UploadBody::Stream(self.storage().get_absolute_path(relative_path))
        } else {
            UploadBody::Bytes(self.storage().get_file_data(relative_path).await.map_err(DomainError::from)?)
        };

        self.throttle
            .run(self.remote.upload(relative_path, body, content_type, timeout))
            .await
    }

    /// Recorded variants first, then ones found on disk, then generated critical sizes.
    async fn upload_variants(&self, asset: &Asset, relative_path: &str, mime_type: &str) -> VariantUploads {
        let mut result = VariantUploads::default();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        seen.insert(relative_path.to_string());

        let mut pending: Vec<(String, String)> = Vec::new();
        for (name, variant_path) in asset.variant_paths() {
            if seen.insert(variant_path.clone()) {
                pending.push((name, variant_path));
            }
        }
        match discover_variants(self.storage().as_ref(), relative_path).await {
            Ok(found) => {
                for variant_path in found {
                    if seen.insert(variant_path.clone()) {
                        pending.push((file_name(&variant_path).to_string(), variant_path));
                    }
                }
            }
            Err(e) => log::warn!("Could not scan for variants of {}: {}", relative_path, e),
        }

        match self.generate_missing_sizes(asset, relative_path, mime_type).await {
            Ok(generated) => {
                for (name, variant_path) in generated {
                    if seen.insert(variant_path.clone()) {
                        pending.push((name, variant_path));
                    }
                }
            }
            Err(e) => log::warn!("Could not generate sizes for {}: {}", file_name(relative_path), e),
        }

        for (key, variant_path) in pending {
            match self.storage().file_info(&variant_path).await {
                Ok(info) if info.exists => {}
                _ => {
                    log::warn!("Variant file not found: {}", variant_path);
                    continue;
                }
            }
            let content_type = guess_mime_type(Path::new(&variant_path))
                .unwrap_or_else(|| mime_type.to_string());
            match self
                .upload_local(&variant_path, &content_type, self.config.variant_upload_timeout)
                .await
            {
                Ok(()) => result.uploaded.push(UploadedVariant { key, relative_path: variant_path }),
                Err(e) => {
                    log::warn!("Failed to upload variant {}: {}", file_name(&variant_path), e);
                    result.failed += 1;
                }
            }
        }
        result
    }

    /// Creates critical sizes the asset has no record of. Returns (size name, relative path).
    async fn generate_missing_sizes(
        &self,
        asset: &Asset,
        relative_path: &str,
        mime_type: &str,
    ) -> DomainResult<Vec<(String, String)>> {
        let Some(format) = ImageFormat::from_mime(mime_type) else {
            return Ok(Vec::new());
        };
        let missing: Vec<_> = critical_sizes(self.config.commerce_sizes)
            .into_iter()
            .filter(|size| !asset.variants.iter().any(|v| v.name == size.name))
            .collect();
        if missing.is_empty() || !super::sizes::can_generate(format) {
            return Ok(Vec::new());
        }

        let data = self.storage().get_file_data(relative_path).await?;
        let generated = generate_sizes(file_name(relative_path).to_string(), data, format, missing).await?;

        let dir = asset.directory().to_string();
        let mut created = Vec::new();
        for size in generated {
            let variant_path = join_relative(&dir, &size.file_name);
            let exists = self.storage().file_info(&variant_path).await?.exists;
            if !exists {
                self.storage().write_file_atomic(&variant_path, size.bytes).await?;
                log::debug!("Generated {} for {}", size.file_name, size.size.name);
            }
            self.resolver
                .record_variant(asset.id, &SizeVariant {
                    name: size.size.name.to_string(),
                    file_name: size.file_name,
                    width: Some(size.width),
                    height: Some(size.height),
                })
                .await?;
            created.push((size.size.name.to_string(), variant_path));
        }
        Ok(created)
    }

    async fn mark_migrated(
        &self,
        asset: &Asset,
        relative_path: &str,
        remote_url: &str,
        variants: &VariantUploads,
    ) -> DomainResult<()> {
        let original_url = self.config.local_url(relative_path);

        let mut size_urls: BTreeMap<String, SizeUrl> = BTreeMap::new();
        for variant in &variants.uploaded {
            if let Some(remote) = self.config.remote_url(&variant.relative_path) {
                size_urls.insert(variant.key.clone(), SizeUrl {
                    original: self.config.local_url(&variant.relative_path),
                    remote,
                });
            }
        }

        let version = if self.config.file_versioning {
            match self.version_token(relative_path).await {
                Ok(token) => Some(token),
                Err(e) => {
                    log::warn!("Could not hash {}: {}", relative_path, e);
                    None
                }
            }
        } else {
            None
        };
        let public_url = match &version {
            Some(token) => versioned_url(remote_url, token),
            None => remote_url.to_string(),
        };

        let mut flags = vec![
            (AssetFlag::Migrated, flag_bool(true)),
            (AssetFlag::BunnyUrl, remote_url.to_string()),
            (AssetFlag::MigrationDate, Utc::now().to_rfc3339()),
            (AssetFlag::OriginalUrl, original_url.clone()),
            (AssetFlag::PublicUrl, public_url.clone()),
        ];
        if !size_urls.is_empty() {
            flags.push((AssetFlag::SizeUrls, serde_json::to_string(&size_urls)?));
        }
        if let Some(token) = version {
            flags.push((AssetFlag::VersionHash, token));
        }
        self.resolver.set_flags(asset.id, &flags).await?;

        let mut replacements = vec![UrlReplacement::new(&original_url, &public_url)];
        replacements.extend(
            size_urls
                .values()
                .map(|urls| UrlReplacement::new(&urls.original, &urls.remote)),
        );
        match self.rewriter.rewrite(&replacements).await {
            Ok(summary) => log::debug!(
                "Rewrote references for asset {}: {} content item(s), {} meta value(s)",
                asset.id, summary.content_updated, summary.meta_updated
            ),
            Err(e) => log::error!("Reference rewrite for asset {} failed: {}", asset.id, e),
        }
        Ok(())
    }

    /// First 8 hex chars of the SHA-256 of the file, read in chunks.
    async fn version_token(&self, relative_path: &str) -> DomainResult<String> {
        let path = self.storage().get_absolute_path(relative_path);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| DomainError::File(format!("Failed to open {}: {}", path.display(), e)))?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let read = file
                .read(&mut buffer)
                .await
                .map_err(|e| DomainError::File(format!("Failed to read {}: {}", path.display(), e)))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        let mut token = hex::encode(hasher.finalize());
        token.truncate(VERSION_TOKEN_LEN);
        Ok(token)
    }

    /// Removes the primary and every uploaded variant, then marks the asset.
    async fn delete_local(&self, asset_id: AssetId, relative_path: &str, variants: &VariantUploads) -> DomainResult<()> {
        self.storage().delete_file(relative_path).await?;
        for variant in &variants.uploaded {
            if let Err(e) = self.storage().delete_file(&variant.relative_path).await {
                log::warn!("Could not delete variant {}: {}", variant.relative_path, e);
            }
        }
        self.resolver
            .set_flags(asset_id, &[(AssetFlag::LocalDeleted, flag_bool(true))])
            .await?;
        log::info!("Completed local file deletion for asset {}", asset_id);
        Ok(())
    }

    /// Relative paths of the primary file and every variant still on disk.
    async fn local_files(&self, asset: &Asset) -> DomainResult<Vec<String>> {
        let mut found = BTreeSet::new();
        if self.storage().file_info(&asset.file_path).await?.exists {
            found.insert(asset.file_path.clone());
        }
        for (_, variant_path) in asset.variant_paths() {
            if self.storage().file_info(&variant_path).await?.exists {
                found.insert(variant_path);
            }
        }
        found.extend(discover_variants(self.storage().as_ref(), &asset.file_path).await?);
        Ok(found.into_iter().collect())
    }

    /// Read-only audit of an asset's migration against what is left on disk.
    pub async fn verify_migration_completeness(&self, asset_id: AssetId) -> DomainResult<MigrationVerification> {
        let asset = self.resolver.require_asset(asset_id).await?;
        let local_files_found = self.local_files(&asset).await?;
        let flags = &asset.flags;
        let status = CompletenessStatus::classify(
            flags.migrated,
            flags.bunny_url.is_some(),
            flags.local_deleted,
            !local_files_found.is_empty(),
        );

        let names = || {
            local_files_found
                .iter()
                .map(|p| file_name(p))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let message = match status {
            CompletenessStatus::NotMigrated => "Asset not marked as migrated".to_string(),
            CompletenessStatus::MissingBunnyUrl => "Migrated but missing remote URL".to_string(),
            CompletenessStatus::IncompleteDeletion => format!("Local files still exist: {}", names()),
            CompletenessStatus::DeletionFailed => format!("Marked as deleted but files still exist: {}", names()),
            CompletenessStatus::Complete => "Migration appears complete".to_string(),
        };

        Ok(MigrationVerification {
            asset_id,
            status,
            is_migrated: flags.migrated,
            bunny_url: flags.bunny_url.clone(),
            local_deleted: flags.local_deleted,
            local_files_found,
            message,
        })
    }

    /// Repairs whatever [`Migrator::verify_migration_completeness`] found.
    pub async fn fix_incomplete_migration(&self, asset_id: AssetId) -> FixOutcome {
        match self.try_fix(asset_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Fixing migration of asset {} failed: {}", asset_id, e);
                FixOutcome::Error { message: e.to_string() }
            }
        }
    }

    async fn try_fix(&self, asset_id: AssetId) -> ServiceResult<FixOutcome> {
        let verification = self.verify_migration_completeness(asset_id).await?;
        if verification.status == CompletenessStatus::Complete {
            return Ok(FixOutcome::AlreadyComplete);
        }

        let asset = self.resolver.require_asset(asset_id).await?;
        let primary_exists = verification.local_files_found.contains(&asset.file_path);
        log::info!(
            "Fixing incomplete migration for asset {} ({})",
            asset_id, verification.status
        );

        let migration = match (verification.status, primary_exists) {
            (CompletenessStatus::NotMigrated, true) => {
                let path = self.absolute(&asset.file_path);
                self.migrate_file(&path).await?
            }
            (_, true) => {
                let path = self.absolute(&asset.file_path);
                self.force_migrate_file(&path).await?
            }
            (CompletenessStatus::IncompleteDeletion | CompletenessStatus::DeletionFailed, false) => {
                for leftover in &verification.local_files_found {
                    self.storage().delete_file(leftover).await.map_err(DomainError::from)?;
                }
                self.resolver
                    .set_flags(asset_id, &[(AssetFlag::LocalDeleted, flag_bool(true))])
                    .await?;
                let after = self.verify_migration_completeness(asset_id).await?;
                return Ok(FixOutcome::Fixed { new_status: after.status });
            }
            (_, false) => {
                return Ok(FixOutcome::Error { message: "File not found".to_string() });
            }
        };

        match migration {
            FileMigration::Migrated { .. } => {
                let after = self.verify_migration_completeness(asset_id).await?;
                Ok(FixOutcome::Fixed { new_status: after.status })
            }
            FileMigration::Ineligible(reason) | FileMigration::Failed(reason) => Ok(FixOutcome::Error {
                message: format!("Migration re-run failed: {}", reason),
            }),
        }
    }

    /// Deletes a migrated asset's objects from remote storage and clears its
    /// migration flags. Returns false when the asset was never migrated.
    pub async fn delete_from_remote(&self, asset_id: AssetId) -> ServiceResult<bool> {
        self.config.storage_credentials()?;
        let asset = self.resolver.require_asset(asset_id).await?;
        if !asset.flags.migrated || asset.flags.bunny_url.is_none() {
            return Ok(false);
        }

        self.remote.delete(&asset.file_path, self.config.delete_timeout).await?;

        let mut variant_keys: BTreeSet<String> = asset
            .variant_paths()
            .into_iter()
            .map(|(_, path)| path)
            .collect();
        if let Some(base) = self.config.remote_base_url() {
            let prefix = format!("{}/", base);
            for urls in asset.flags.size_urls.values() {
                if let Some(key) = urls.remote.strip_prefix(&prefix) {
                    variant_keys.insert(key.to_string());
                }
            }
        }
        for key in variant_keys {
            if let Err(e) = self.remote.delete(&key, self.config.delete_timeout).await {
                log::warn!("Could not delete remote variant {}: {}", key, e);
            }
        }

        self.resolver
            .delete_flags(asset_id, &[
                AssetFlag::Migrated,
                AssetFlag::BunnyUrl,
                AssetFlag::MigrationDate,
                AssetFlag::VersionHash,
                AssetFlag::SizeUrls,
                AssetFlag::PublicUrl,
            ])
            .await?;
        log::info!("Deleted asset {} from remote storage", asset_id);
        Ok(true)
    }

    /// Checks credentials, then lists the storage zone.
    pub async fn test_connection(&self) -> ServiceResult<()> {
        self.config.storage_credentials()?;
        self.remote.test_connection().await
    }

    fn absolute(&self, relative_path: &str) -> String {
        self.storage()
            .get_absolute_path(relative_path)
            .to_string_lossy()
            .into_owned()
    }
}

#[async_trait]
impl BatchProcessor for Migrator {
    async fn process_batch(&self, paths: &[String]) -> BatchOutcome {
        self.migrate_batch(paths).await
    }
}

#[async_trait]
impl EligibilityCheck for Migrator {
    async fn is_eligible(&self, path: &str) -> bool {
        self.is_eligible_for_migration(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::offload::services::tests_support::{png_bytes, Harness};
    use crate::domains::queue::types::QueueName;

    fn webp_bytes(len: usize) -> Vec<u8> {
        let mut bytes = b"RIFF\x00\x00\x00\x00WEBPVP8 ".to_vec();
        bytes.resize(len, 1);
        bytes
    }

    #[tokio::test]
    async fn test_webp_with_variants_is_fully_migrated() {
        let h = Harness::new(Harness::config()).await;
        let id = h.add_image("2024/05/a.webp", "image/webp", webp_bytes(50 * 1024)).await;
        h.write("2024/05/a-300x300.webp", webp_bytes(2048)).await;
        h.write("2024/05/a-150x150.webp", webp_bytes(1024)).await;
        h.write("2024/05/b-300x300.webp", webp_bytes(1024)).await;

        let queue = h.services.queue(QueueName::Migration);
        queue.add(&h.abs("2024/05/a.webp")).await.unwrap();
        let result = queue.process(&*h.services.migrator, 3).await.unwrap();
        assert_eq!(result.outcome.success_count(), Some(1));
        assert_eq!(queue.size().await.unwrap(), 0);

        let asset = h.services.resolver.require_asset(id).await.unwrap();
        assert!(asset.flags.migrated);
        assert!(asset.flags.local_deleted);
        assert_eq!(asset.flags.bunny_url.as_deref(), Some("https://zone.b-cdn.net/2024/05/a.webp"));
        assert_eq!(asset.flags.size_urls.len(), 2);

        for uploaded in ["2024/05/a.webp", "2024/05/a-300x300.webp", "2024/05/a-150x150.webp"] {
            assert!(h.remote_storage.contains(uploaded), "{}", uploaded);
            assert!(!h.storage().file_info(uploaded).await.unwrap().exists, "{}", uploaded);
        }
        assert!(!h.remote_storage.contains("2024/05/b-300x300.webp"));
        assert!(h.storage().file_info("2024/05/b-300x300.webp").await.unwrap().exists);
    }

    #[tokio::test]
    async fn test_migrate_then_verify_is_complete() {
        let h = Harness::new(Harness::config()).await;
        let id = h.add_image("2024/05/a.webp", "image/webp", webp_bytes(4096)).await;

        let outcome = h.services.migrator.migrate_batch(&[h.abs("2024/05/a.webp")]).await;
        assert_eq!(outcome.success_count(), Some(1));

        let verification = h.services.migrator.verify_migration_completeness(id).await.unwrap();
        assert_eq!(verification.status, CompletenessStatus::Complete);
        assert!(verification.local_files_found.is_empty());
        assert_eq!(h.services.migrator.fix_incomplete_migration(id).await, FixOutcome::AlreadyComplete);
    }

    #[tokio::test]
    async fn test_primary_upload_failure_changes_nothing() {
        let h = Harness::new(Harness::config()).await;
        let id = h.add_image("2024/05/a.webp", "image/webp", webp_bytes(4096)).await;
        h.remote_storage.fail_path("2024/05/a.webp");

        let outcome = h.services.migrator.migrate_batch(&[h.abs("2024/05/a.webp")]).await;
        let BatchOutcome::Processed(report) = outcome else { panic!("expected processed") };
        assert_eq!(report.failed.len(), 1);
        // One regular attempt plus the forced retry.
        assert_eq!(h.remote_storage.upload_count(), 2);

        let asset = h.services.resolver.require_asset(id).await.unwrap();
        assert!(!asset.flags.migrated);
        assert!(h.storage().file_info("2024/05/a.webp").await.unwrap().exists);
    }

    #[tokio::test]
    async fn test_variant_failure_is_not_fatal() {
        let h = Harness::new(Harness::config()).await;
        let id = h.add_image("2024/05/a.webp", "image/webp", webp_bytes(4096)).await;
        h.write("2024/05/a-300x300.webp", webp_bytes(1024)).await;
        h.remote_storage.fail_path("2024/05/a-300x300.webp");

        let outcome = h.services.migrator.migrate_batch(&[h.abs("2024/05/a.webp")]).await;
        assert_eq!(outcome.success_count(), Some(1));

        // The variant that did not upload stays on disk.
        assert!(h.storage().file_info("2024/05/a-300x300.webp").await.unwrap().exists);
        let verification = h.services.migrator.verify_migration_completeness(id).await.unwrap();
        assert_eq!(verification.status, CompletenessStatus::DeletionFailed);

        h.remote_storage.clear_failures();
        let fixed = h.services.migrator.fix_incomplete_migration(id).await;
        assert_eq!(fixed, FixOutcome::Fixed { new_status: CompletenessStatus::Complete });
        assert!(!h.storage().file_info("2024/05/a-300x300.webp").await.unwrap().exists);
    }

    #[tokio::test]
    async fn test_ineligible_files_are_not_force_migrated() {
        let h = Harness::new(Harness::config()).await;
        h.add_image("2024/05/big.webp", "image/webp", webp_bytes(200 * 1024)).await;

        let outcome = h.services.migrator.migrate_batch(&[h.abs("2024/05/big.webp")]).await;
        let BatchOutcome::Processed(report) = outcome else { panic!("expected processed") };
        assert_eq!(report.ineligible.len(), 1);
        assert_eq!(h.remote_storage.upload_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_credentials_are_not_configured() {
        let h = Harness::new(OffloadConfig { storage_zone: None, ..Harness::config() }).await;
        let outcome = h.services.migrator.migrate_batch(&["2024/05/a.webp".to_string()]).await;
        assert!(matches!(outcome, BatchOutcome::NotConfigured { .. }));
    }

    #[tokio::test]
    async fn test_png_gets_critical_sizes_and_versioning() {
        let h = Harness::new(OffloadConfig { file_versioning: true, ..Harness::config() }).await;
        let id = h.add_image("2024/05/p.png", "image/png", png_bytes(400)).await;

        let outcome = h.services.migrator.migrate_batch(&[h.abs("2024/05/p.png")]).await;
        assert_eq!(outcome.success_count(), Some(1));

        assert!(h.remote_storage.contains("2024/05/p-150x150.png"));
        assert!(h.remote_storage.contains("2024/05/p-300x300.png"));
        let asset = h.services.resolver.require_asset(id).await.unwrap();
        assert!(asset.variants.iter().any(|v| v.name == "thumbnail"));
        let token = asset.flags.version_hash.clone().unwrap();
        assert_eq!(token.len(), 8);
        assert!(asset.flags.size_urls.contains_key("medium"));

        // The token is carried by the public URL, not the storage URL.
        let plain = "https://zone.b-cdn.net/2024/05/p.png";
        assert_eq!(asset.flags.bunny_url.as_deref(), Some(plain));
        let expected = format!("{}?v={}", plain, token);
        assert_eq!(asset.flags.public_url.as_deref(), Some(expected.as_str()));
        assert_eq!(h.services.resolver.public_url(&asset), expected);
    }

    #[tokio::test]
    async fn test_large_files_are_streamed() {
        let h = Harness::new(OffloadConfig {
            large_file_threshold: 1024,
            ..Harness::config()
        })
        .await;
        h.add_image("2024/05/a.webp", "image/webp", webp_bytes(4096)).await;

        h.services.migrator.migrate_batch(&[h.abs("2024/05/a.webp")]).await;
        let log = h.remote_storage.upload_log.lock().unwrap().clone();
        assert_eq!(log, vec![("2024/05/a.webp".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_references_are_rewritten() {
        let h = Harness::new(Harness::config()).await;
        h.add_image("2024/05/a.webp", "image/webp", webp_bytes(4096)).await;
        h.write("2024/05/a-300x300.webp", webp_bytes(1024)).await;
        let body = format!(
            "<img src=\"{}\" srcset=\"{} 300w\">",
            h.services.config.local_url("2024/05/a.webp"),
            h.services.config.local_url("2024/05/a-300x300.webp")
        );
        sqlx::query("INSERT INTO content_items (body) VALUES (?)")
            .bind(body)
            .execute(&h.pool)
            .await
            .unwrap();

        h.services.migrator.migrate_batch(&[h.abs("2024/05/a.webp")]).await;

        let body: String = sqlx::query_scalar("SELECT body FROM content_items")
            .fetch_one(&h.pool)
            .await
            .unwrap();
        assert!(body.contains("https://zone.b-cdn.net/2024/05/a.webp"));
        assert!(body.contains("https://zone.b-cdn.net/2024/05/a-300x300.webp"));
        assert!(!body.contains("localhost"));
    }

    #[tokio::test]
    async fn test_delete_from_remote_clears_flags() {
        let h = Harness::new(Harness::config()).await;
        let id = h.add_image("2024/05/a.webp", "image/webp", webp_bytes(4096)).await;
        h.write("2024/05/a-300x300.webp", webp_bytes(1024)).await;
        assert!(!h.services.migrator.delete_from_remote(id).await.unwrap());

        h.services.migrator.migrate_batch(&[h.abs("2024/05/a.webp")]).await;
        assert!(h.services.migrator.delete_from_remote(id).await.unwrap());

        assert!(h.remote_storage.keys().is_empty());
        let asset = h.services.resolver.require_asset(id).await.unwrap();
        assert!(!asset.flags.migrated);
        assert!(asset.flags.bunny_url.is_none());
        assert!(asset.flags.size_urls.is_empty());
    }

    #[tokio::test]
    async fn test_flag_without_remote_url_allows_remigration() {
        let h = Harness::new(Harness::config()).await;
        let id = h.add_image("2024/05/a.webp", "image/webp", webp_bytes(4096)).await;
        h.services
            .resolver
            .set_flags(id, &[(AssetFlag::Migrated, flag_bool(true)), (AssetFlag::BunnyUrl, String::new())])
            .await
            .unwrap();

        assert!(h.services.migrator.is_eligible_for_migration(&h.abs("2024/05/a.webp")).await);
    }

    #[tokio::test]
    async fn test_throttle_spaces_calls() {
        let throttle = UploadThrottle::new(Duration::from_millis(30));
        let start = Instant::now();
        for _ in 0..3 {
            throttle.run(async {}).await;
        }
        assert!(start.elapsed() >= Duration::from_millis(60));
    }
}
