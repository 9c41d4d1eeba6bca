//! Batch optimization through the remote API.
//!
//! A batch runs Validate, PrepareRequest, Send, ApplyResult and UpdateMetadata
//! in that order. Transport problems fail the whole batch; anything that goes
//! wrong with a single file only fails that file.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use std::sync::Arc;

use crate::config::OffloadConfig;
use crate::domains::asset::content::{ReferenceRewriter, UrlReplacement};
use crate::domains::asset::resolver::AttachmentResolver;
use crate::domains::asset::types::{flag_bool, AssetFlag};
use crate::domains::core::file_storage_service::{file_name, FileStorageService};
use crate::domains::core::media_types::ImageFormat;
use crate::domains::eligibility::rules;
use crate::domains::eligibility::service::EligibilityService;
use crate::domains::eligibility::types::{Candidate, Ineligible};
use crate::domains::queue::service::WorkQueue;
use crate::domains::queue::types::{BatchOutcome, BatchProcessor, BatchReport, EligibilityCheck};
use crate::errors::{DomainError, DomainResult};
use super::client::OptimizationApi;
use super::types::{ImagePayload, OptimizeRequest, OptimizeResult, OptimizedData};
use super::validation::{decode_image_payload, validate_image_bytes};

/// A candidate whose bytes were read for the request.
struct Prepared {
    candidate: Candidate,
    original_size: u64,
}

/// Where an applied result ended up.
struct Applied {
    relative_path: String,
    format: ImageFormat,
    written: u64,
}

pub struct Optimizer {
    config: Arc<OffloadConfig>,
    api: Arc<dyn OptimizationApi>,
    eligibility: Arc<EligibilityService>,
    resolver: Arc<AttachmentResolver>,
    rewriter: Arc<ReferenceRewriter>,
    migration_queue: WorkQueue,
}

impl Optimizer {
    pub fn new(
        config: Arc<OffloadConfig>,
        api: Arc<dyn OptimizationApi>,
        eligibility: Arc<EligibilityService>,
        resolver: Arc<AttachmentResolver>,
        rewriter: Arc<ReferenceRewriter>,
        migration_queue: WorkQueue,
    ) -> Self {
        Self {
            config,
            api,
            eligibility,
            resolver,
            rewriter,
            migration_queue,
        }
    }

    fn storage(&self) -> &Arc<dyn FileStorageService> {
        self.resolver.storage()
    }

    /// Whether `path` qualifies for optimization right now.
    ///
    /// A webp/avif file that is too small to optimize is queued for migration
    /// instead when auto-migrate is on.
    pub async fn is_eligible_for_optimization(&self, path: &str) -> bool {
        match self.eligibility.check_optimization(path).await {
            Ok(Ok(_)) => true,
            Ok(Err(Ineligible::SizeOutOfRange { size_kb })) => {
                if self.config.auto_migrate && size_kb <= self.config.max_file_size_kb as f64 {
                    match self.migration_queue.add(path).await {
                        Ok(true) => log::info!("File added to migration queue: {}", file_name(path)),
                        Ok(false) => {}
                        Err(e) => log::warn!("Could not queue {} for migration: {}", path, e),
                    }
                }
                log::debug!("Not eligible for optimization: {}", file_name(path));
                false
            }
            Ok(Err(reason)) => {
                log::debug!("{}: {}", reason, file_name(path));
                false
            }
            Err(e) => {
                log::error!("Eligibility check failed for {}: {}", path, e);
                false
            }
        }
    }

    /// Optimizes up to one batch of paths. Never returns an error; see [`BatchOutcome`].
    pub async fn optimize_batch(&self, paths: &[String]) -> BatchOutcome {
        let api_key = match self.config.optimization_credentials() {
            Ok(key) => key.to_string(),
            Err(e) => return BatchOutcome::NotConfigured { message: e.to_string() },
        };

        let mut report = BatchReport::default();

        // Validate
        let checked = match self.eligibility.check_optimization_batch(paths).await {
            Ok(checked) => checked,
            Err(e) => return BatchOutcome::Failed { reason: format!("Eligibility check failed: {}", e) },
        };
        let mut candidates = Vec::new();
        for (path, outcome) in checked {
            match outcome {
                Ok(candidate) => candidates.push(candidate),
                Err(reason) => report.skip_ineligible(&path, reason.to_string()),
            }
        }
        if candidates.is_empty() {
            log::info!("No eligible files in optimization batch of {}", paths.len());
            return BatchOutcome::Processed(report);
        }

        // PrepareRequest
        let mut prepared = Vec::new();
        let mut images = Vec::new();
        for candidate in candidates {
            match self.prepare_image(&candidate).await {
                Ok((payload, original_size)) => {
                    images.push(payload);
                    prepared.push(Prepared { candidate, original_size });
                }
                Err(e) => report.fail(&candidate.path, format!("Failed to prepare image data: {}", e)),
            }
        }
        if prepared.is_empty() {
            return BatchOutcome::Processed(report);
        }

        let request = OptimizeRequest {
            images,
            max_size_kb: self.config.max_file_size_kb,
            supports_avif: true,
            supports_heif: true,
        };

        // Send
        let results = match self.api.optimize(&api_key, &request).await {
            Ok(results) => results,
            Err(e) if e.is_configuration() => return BatchOutcome::NotConfigured { message: e.to_string() },
            Err(e) => {
                log::error!("Optimization request for {} file(s) failed: {}", prepared.len(), e);
                return BatchOutcome::Failed { reason: e.to_string() };
            }
        };
        if results.len() != prepared.len() {
            log::warn!(
                "Optimization API returned {} result(s) for {} image(s)",
                results.len(),
                prepared.len()
            );
        }

        // ApplyResult + UpdateMetadata
        for (index, item) in prepared.iter().enumerate() {
            let path = &item.candidate.path;
            let name = file_name(&item.candidate.relative_path).to_string();
            match results.get(index) {
                Some(OptimizeResult::Optimized(data)) => match self.apply_optimized(item, data).await {
                    Ok(applied) => {
                        let message = format!(
                            "Optimized {} ({} -> {} bytes)",
                            file_name(&applied.relative_path),
                            item.original_size,
                            applied.written
                        );
                        self.queue_for_migration(&applied).await;
                        report.succeed(path, message);
                    }
                    Err(e) => report.fail(path, format!("Failed to apply result for {}: {}", name, e)),
                },
                Some(OptimizeResult::Skipped) => match self.mark_skipped(item).await {
                    Ok(()) => report.succeed(path, format!("Skipped optimization for {} (marked as optimized)", name)),
                    Err(e) => report.fail(path, format!("Failed to mark {} as optimized: {}", name, e)),
                },
                Some(OptimizeResult::Failed(reason)) => {
                    report.fail(path, format!("Failed to optimize {}. Reason: {}", name, reason))
                }
                None => report.fail(path, format!("No result returned for {}", name)),
            }
        }

        self.eligibility.invalidate_stats();
        log::info!(
            "Optimization batch finished: {} of {} succeeded",
            report.success_count(),
            report.attempted()
        );
        BatchOutcome::Processed(report)
    }

    async fn prepare_image(&self, candidate: &Candidate) -> DomainResult<(ImagePayload, u64)> {
        let bytes = self.storage().get_file_data(&candidate.relative_path).await?;
        if bytes.is_empty() {
            return Err(DomainError::File(format!("{} is empty", candidate.relative_path)));
        }
        let size = bytes.len() as u64;
        log::debug!(
            "Prepared image data for {} ({:.2} KB, {})",
            file_name(&candidate.relative_path),
            size as f64 / 1024.0,
            candidate.mime_type
        );
        let payload = ImagePayload {
            file: file_name(&candidate.relative_path).to_string(),
            image_data: format!("data:{};base64,{}", candidate.mime_type, STANDARD.encode(&bytes)),
        };
        Ok((payload, size))
    }

    async fn apply_optimized(&self, item: &Prepared, data: &OptimizedData) -> DomainResult<Applied> {
        let candidate = &item.candidate;
        let bytes = decode_image_payload(&data.base64)?;

        let original_format = ImageFormat::from_mime(&candidate.mime_type)
            .or_else(|| extension_of(&candidate.relative_path).and_then(ImageFormat::from_extension))
            .ok_or_else(|| DomainError::Image(format!("Unknown source format for {}", candidate.relative_path)))?;
        let target_format = data
            .target_format
            .as_deref()
            .and_then(ImageFormat::from_target)
            .unwrap_or(original_format);

        validate_image_bytes(&bytes, target_format)?;

        let applied = if target_format == original_format {
            let written = self.storage().write_file_atomic(&candidate.relative_path, bytes).await?;
            log::info!("Updated {} in place", file_name(&candidate.relative_path));
            Applied {
                relative_path: candidate.relative_path.clone(),
                format: original_format,
                written,
            }
        } else {
            self.convert_format(candidate, original_format, target_format, bytes).await?
        };

        let stats = data.stats(item.original_size, applied.written);
        self.mark_optimized(candidate.asset.id, applied.written, &serde_json::to_string(&stats)?).await?;
        Ok(applied)
    }

    /// Writes the converted file next to the original, repoints the asset and
    /// every stored reference at it, then removes the original.
    async fn convert_format(
        &self,
        candidate: &Candidate,
        from: ImageFormat,
        to: ImageFormat,
        bytes: Vec<u8>,
    ) -> DomainResult<Applied> {
        let old_relative = candidate.relative_path.as_str();
        let (extension, mime_type) = to.output_extension_and_mime();
        let new_relative = replace_extension(old_relative, extension);
        log::info!(
            "Converting {} from {} to {}",
            file_name(old_relative),
            from.name(),
            to.name()
        );

        let written = self.storage().write_file_atomic(&new_relative, bytes).await?;

        let asset_id = candidate.asset.id;
        let old_url = self.config.local_url(old_relative);
        let new_url = self.config.local_url(&new_relative);

        self.resolver
            .update_primary_file(asset_id, old_relative, &new_relative, mime_type)
            .await?;
        self.resolver
            .set_flags(asset_id, &[
                (AssetFlag::OriginalPath, candidate.asset.file_path.clone()),
                (AssetFlag::OldUrl, old_url.clone()),
                (AssetFlag::NewUrl, new_url.clone()),
            ])
            .await?;
        self.rewriter.rewrite(&[UrlReplacement::new(&old_url, &new_url)]).await?;

        if new_relative != old_relative {
            if let Err(e) = self.storage().delete_file(old_relative).await {
                log::warn!("Could not delete original {}: {}", old_relative, e);
            }
        }
        log::info!("URL change: {} -> {}", file_name(old_relative), file_name(&new_relative));

        Ok(Applied {
            relative_path: new_relative,
            format: to,
            written,
        })
    }

    async fn mark_skipped(&self, item: &Prepared) -> DomainResult<()> {
        let data = OptimizedData::default();
        let mut stats = data.stats(item.original_size, item.original_size);
        stats.original_format = ImageFormat::from_mime(&item.candidate.mime_type).map(|f| f.name().to_string());
        stats.target_format = stats.original_format.clone();
        self.mark_optimized(item.candidate.asset.id, item.original_size, &serde_json::to_string(&stats)?)
            .await
    }

    async fn mark_optimized(&self, asset_id: i64, file_size: u64, stats_json: &str) -> DomainResult<()> {
        self.resolver
            .set_flags(asset_id, &[
                (AssetFlag::Optimized, flag_bool(true)),
                (AssetFlag::OptimizationDate, Utc::now().to_rfc3339()),
                (AssetFlag::FileSize, file_size.to_string()),
                (AssetFlag::OptimizationStats, stats_json.to_string()),
            ])
            .await
    }

    /// Chains a freshly optimized file onto the migration queue when it now qualifies.
    async fn queue_for_migration(&self, applied: &Applied) {
        if !self.config.auto_migrate {
            return;
        }
        let size_kb = applied.written as f64 / 1024.0;
        if !rules::migration_type_ok(applied.format)
            || !rules::migration_size_ok(size_kb, self.config.max_file_size_kb)
        {
            return;
        }
        let path = self
            .storage()
            .get_absolute_path(&applied.relative_path)
            .to_string_lossy()
            .into_owned();
        match self.migration_queue.add(&path).await {
            Ok(true) => log::info!("Queued optimized {} for migration", file_name(&applied.relative_path)),
            Ok(false) => {}
            Err(e) => log::warn!("Could not queue {} for migration: {}", path, e),
        }
    }
}

fn extension_of(relative_path: &str) -> Option<&str> {
    file_name(relative_path).rsplit_once('.').map(|(_, ext)| ext)
}

/// `2024/05/a.png` + `webp` -> `2024/05/a.webp`
fn replace_extension(relative_path: &str, extension: &str) -> String {
    let name = file_name(relative_path);
    let stem_len = match name.rfind('.') {
        Some(0) | None => name.len(),
        Some(dot) => dot,
    };
    let prefix_len = relative_path.len() - name.len();
    format!("{}.{}", &relative_path[..prefix_len + stem_len], extension)
}

#[async_trait]
impl BatchProcessor for Optimizer {
    async fn process_batch(&self, paths: &[String]) -> BatchOutcome {
        self.optimize_batch(paths).await
    }
}

#[async_trait]
impl EligibilityCheck for Optimizer {
    async fn is_eligible(&self, path: &str) -> bool {
        self.is_eligible_for_optimization(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::offload::services::tests_support::{png_bytes, Harness};
    use crate::domains::queue::types::QueueName;
    use crate::errors::ServiceError;

    fn optimized(bytes: &[u8], target: &str) -> OptimizeResult {
        OptimizeResult::Optimized(OptimizedData {
            base64: format!("data:image/{};base64,{}", target, STANDARD.encode(bytes)),
            target_format: Some(target.to_string()),
            original_size: Some(4096),
            compressed_size: Some(bytes.len() as u64),
            ..OptimizedData::default()
        })
    }

    #[test]
    fn test_replace_extension() {
        assert_eq!(replace_extension("2024/05/a.png", "webp"), "2024/05/a.webp");
        assert_eq!(replace_extension("a.b.jpeg", "avif"), "a.b.avif");
        assert_eq!(replace_extension("2024/05/noext", "jpg"), "2024/05/noext.jpg");
    }

    #[tokio::test]
    async fn test_one_success_one_failure() {
        let h = Harness::new(Harness::config()).await;
        let first = h.add_image("2024/05/a.png", "image/png", png_bytes(16)).await;
        h.add_image("2024/05/b.png", "image/png", png_bytes(16)).await;
        h.optimization_api.push_response(Ok(vec![
            optimized(&png_bytes(8), "png"),
            OptimizeResult::Failed("too large".into()),
        ]));

        let queue = &h.services.optimization_queue;
        queue.add_batch(&[h.abs("2024/05/a.png"), h.abs("2024/05/b.png")]).await.unwrap();
        let result = queue.process(&*h.services.optimizer, 5).await.unwrap();

        assert_eq!(result.outcome.success_count(), Some(1));
        assert_eq!(queue.get_all().await.unwrap(), vec![h.abs("2024/05/b.png")]);
        let asset = h.services.resolver.require_asset(first).await.unwrap();
        assert!(asset.flags.optimized);
        assert_eq!(asset.flags.optimization_stats.unwrap().original_size, 4096);
        assert_eq!(
            h.storage().get_file_data("2024/05/a.png").await.unwrap(),
            png_bytes(8)
        );
    }

    #[tokio::test]
    async fn test_empty_results_leave_queue_unchanged() {
        let h = Harness::new(Harness::config()).await;
        h.add_image("2024/05/a.png", "image/png", png_bytes(16)).await;
        h.add_image("2024/05/b.jpg", "image/jpeg", vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3]).await;
        h.optimization_api.push_response(Ok(Vec::new()));

        let queue = &h.services.optimization_queue;
        queue.add_batch(&[h.abs("2024/05/a.png"), h.abs("2024/05/b.jpg")]).await.unwrap();
        let result = queue.process(&*h.services.optimizer, 5).await.unwrap();

        assert_eq!(result.outcome.success_count(), Some(0));
        assert_eq!(queue.size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_transport_failure_fails_whole_batch() {
        let h = Harness::new(Harness::config()).await;
        h.add_image("2024/05/a.png", "image/png", png_bytes(16)).await;
        h.optimization_api.push_response(Err(ServiceError::Timeout("after 120s".into())));

        let outcome = h.services.optimizer.optimize_batch(&[h.abs("2024/05/a.png")]).await;
        assert!(matches!(outcome, BatchOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let h = Harness::new(OffloadConfig { optimization_api_key: None, ..Harness::config() }).await;
        let outcome = h.services.optimizer.optimize_batch(&["2024/05/a.png".to_string()]).await;
        assert!(matches!(outcome, BatchOutcome::NotConfigured { .. }));
        assert_eq!(h.optimization_api.request_count(), 0);
    }

    #[tokio::test]
    async fn test_ineligible_paths_are_dropped_without_a_request() {
        let h = Harness::new(Harness::config()).await;
        h.add_image("2024/05/a.gif", "image/gif", vec![b'G'; 64]).await;

        let outcome = h.services.optimizer.optimize_batch(&[h.abs("2024/05/a.gif"), h.abs("2024/05/none.png")]).await;
        match outcome {
            BatchOutcome::Processed(report) => {
                assert_eq!(report.ineligible.len(), 2);
                assert!(report.succeeded.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.optimization_api.request_count(), 0);
    }

    #[tokio::test]
    async fn test_format_conversion_rewrites_references_and_chains_migration() {
        let h = Harness::new(OffloadConfig { auto_migrate: true, ..Harness::config() }).await;
        let id = h.add_image("2024/05/a.png", "image/png", png_bytes(16)).await;
        let old_url = h.services.config.local_url("2024/05/a.png");
        sqlx::query("INSERT INTO content_items (body) VALUES (?)")
            .bind(format!("<img src=\"{}\">", old_url))
            .execute(&h.pool)
            .await
            .unwrap();

        let mut webp = b"RIFF\x00\x00\x00\x00WEBPVP8 ".to_vec();
        webp.resize(200, 7);
        h.optimization_api.push_response(Ok(vec![optimized(&webp, "webp")]));

        let outcome = h.services.optimizer.optimize_batch(&[h.abs("2024/05/a.png")]).await;
        assert_eq!(outcome.success_count(), Some(1));

        let asset = h.services.resolver.require_asset(id).await.unwrap();
        assert_eq!(asset.file_path, "2024/05/a.webp");
        assert_eq!(asset.mime_type, "image/webp");
        assert!(!h.storage().file_info("2024/05/a.png").await.unwrap().exists);
        assert!(h.storage().file_info("2024/05/a.webp").await.unwrap().exists);

        let body: String = sqlx::query_scalar("SELECT body FROM content_items")
            .fetch_one(&h.pool)
            .await
            .unwrap();
        assert!(body.contains("2024/05/a.webp"));

        assert_eq!(
            h.services.queue(QueueName::Migration).get_all().await.unwrap(),
            vec![h.abs("2024/05/a.webp")]
        );
    }

    #[tokio::test]
    async fn test_invalid_payload_fails_only_that_file() {
        let h = Harness::new(Harness::config()).await;
        h.add_image("2024/05/a.png", "image/png", png_bytes(16)).await;
        h.add_image("2024/05/b.png", "image/png", png_bytes(16)).await;
        h.optimization_api.push_response(Ok(vec![
            optimized(b"GIF89a not a png at all, definitely long enough to pass size", "png"),
            OptimizeResult::Skipped,
        ]));

        let outcome = h.services.optimizer.optimize_batch(&[h.abs("2024/05/a.png"), h.abs("2024/05/b.png")]).await;
        let BatchOutcome::Processed(report) = outcome else { panic!("expected processed") };
        assert_eq!(report.succeeded, vec![h.abs("2024/05/b.png")]);
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_small_webp_is_routed_to_migration() {
        let h = Harness::new(OffloadConfig { auto_migrate: true, ..Harness::config() }).await;
        h.add_image("2024/05/s.webp", "image/webp", vec![0u8; 10 * 1024]).await;

        assert!(!h.services.optimizer.is_eligible_for_optimization(&h.abs("2024/05/s.webp")).await);
        assert_eq!(h.services.queue(QueueName::Migration).size().await.unwrap(), 1);
    }
}
