//! Maps file paths to their owning asset and back.
//!
//! Lookups are read-through cached. Every flag or path write goes through
//! this type so the caches (and the eligibility stats cache) are invalidated
//! in one place.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::OffloadConfig;
use crate::domains::core::cache::{LookupCache, MokaLookupCache};
use crate::domains::core::file_storage_service::{file_name, lexical_relative, FileStorageService};
use crate::domains::eligibility::types::EligibilityStats;
use crate::errors::{DomainError, DomainResult};
use super::repository::AssetRepository;
use super::types::{Asset, AssetFlag, AssetId, SizeVariant};
use super::variants::discover_variants;

const CACHE_CAPACITY: u64 = 10_000;

/// Trailing `YYYY/MM/file` segment of an upload path.
static DATED_UPLOAD_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{4}/\d{2}/[^/]+)$").expect("static regex")
});

/// Appends the cache-busting `v` query parameter.
pub fn versioned_url(url: &str, token: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}v={}", url, separator, token)
}

pub struct AttachmentResolver {
    config: Arc<OffloadConfig>,
    assets: Arc<dyn AssetRepository>,
    storage: Arc<dyn FileStorageService>,
    path_cache: Arc<dyn LookupCache<AssetId>>,
    asset_cache: Arc<dyn LookupCache<Asset>>,
    stats_cache: Arc<dyn LookupCache<EligibilityStats>>,
}

impl AttachmentResolver {
    pub fn new(
        config: Arc<OffloadConfig>,
        assets: Arc<dyn AssetRepository>,
        storage: Arc<dyn FileStorageService>,
        path_cache: Arc<dyn LookupCache<AssetId>>,
        asset_cache: Arc<dyn LookupCache<Asset>>,
        stats_cache: Arc<dyn LookupCache<EligibilityStats>>,
    ) -> Self {
        Self {
            config,
            assets,
            storage,
            path_cache,
            asset_cache,
            stats_cache,
        }
    }

    /// Resolver with moka caches using the configured TTL.
    pub fn with_default_caches(
        config: Arc<OffloadConfig>,
        assets: Arc<dyn AssetRepository>,
        storage: Arc<dyn FileStorageService>,
        stats_cache: Arc<dyn LookupCache<EligibilityStats>>,
    ) -> Self {
        let ttl = config.resolver_cache_ttl;
        Self::new(
            config,
            assets,
            storage,
            Arc::new(MokaLookupCache::with_ttl(CACHE_CAPACITY, ttl)),
            Arc::new(MokaLookupCache::with_ttl(CACHE_CAPACITY, ttl)),
            stats_cache,
        )
    }

    pub fn storage(&self) -> &Arc<dyn FileStorageService> {
        &self.storage
    }

    /// Storage-relative form of `path`, tolerating root drift between environments.
    pub fn normalize_path(&self, path: &str) -> Option<String> {
        let path = path.trim();
        if path.is_empty() {
            return None;
        }
        if let Some(relative) = self.storage.relative_path(path) {
            return Some(relative);
        }
        for mapping in &self.config.path_mappings {
            if let Some(rest) = path.strip_prefix(mapping.from.as_str()) {
                let mapped = format!("{}{}", mapping.to, rest);
                if let Some(relative) = self.storage.relative_path(&mapped) {
                    return Some(relative);
                }
            }
        }
        DATED_UPLOAD_PATH
            .captures(path)
            .map(|caps| caps[1].to_string())
            .or_else(|| lexical_relative(path))
    }

    /// Owning asset of a file, or `None` when nothing matches.
    pub async fn resolve(&self, path: &str) -> DomainResult<Option<AssetId>> {
        match self.normalize_path(path) {
            Some(relative) => self.resolve_relative(&relative).await,
            None => Ok(None),
        }
    }

    pub async fn resolve_relative(&self, relative_path: &str) -> DomainResult<Option<AssetId>> {
        if let Some(id) = self.path_cache.get(relative_path).await {
            return Ok(Some(id));
        }

        let found = match self.assets.find_by_path(relative_path).await? {
            Some(id) => Some(id),
            None => self.resolve_by_file_name(relative_path).await?,
        };

        if let Some(id) = found {
            self.path_cache.insert(relative_path.to_string(), id).await;
        }
        Ok(found)
    }

    async fn resolve_by_file_name(&self, relative_path: &str) -> DomainResult<Option<AssetId>> {
        let name = file_name(relative_path);
        if name.is_empty() {
            return Ok(None);
        }
        let candidates = self.assets.find_by_file_name(name).await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let chosen = candidates
            .iter()
            .find(|(_, path)| path == relative_path)
            .or_else(|| candidates.iter().find(|(_, path)| file_name(path) == name))
            .map(|(id, _)| *id);

        if let Some(id) = chosen {
            log::debug!("Resolved '{}' by file name to asset {}", relative_path, id);
        }
        Ok(chosen)
    }

    /// Resolves many paths at once. Keys of the result are the input paths.
    pub async fn resolve_batch(&self, paths: &[String]) -> DomainResult<HashMap<String, AssetId>> {
        let mut resolved = HashMap::new();
        let mut pending: Vec<(String, String)> = Vec::new();

        for path in paths {
            let Some(relative) = self.normalize_path(path) else {
                continue;
            };
            match self.path_cache.get(&relative).await {
                Some(id) => {
                    resolved.insert(path.clone(), id);
                }
                None => pending.push((path.clone(), relative)),
            }
        }

        if pending.is_empty() {
            return Ok(resolved);
        }

        let relatives: Vec<String> = pending.iter().map(|(_, relative)| relative.clone()).collect();
        let exact = self.assets.find_by_path_batch(&relatives).await?;

        for (path, relative) in pending {
            let id = match exact.get(&relative) {
                Some(id) => Some(*id),
                None => self.resolve_by_file_name(&relative).await?,
            };
            if let Some(id) = id {
                self.path_cache.insert(relative, id).await;
                resolved.insert(path, id);
            }
        }

        Ok(resolved)
    }

    /// Read-through cached asset record.
    pub async fn load_asset(&self, id: AssetId) -> DomainResult<Option<Asset>> {
        let key = id.to_string();
        if let Some(asset) = self.asset_cache.get(&key).await {
            return Ok(Some(asset));
        }
        let asset = self.assets.get_asset(id).await?;
        if let Some(asset) = &asset {
            self.asset_cache.insert(key, asset.clone()).await;
        }
        Ok(asset)
    }

    pub async fn require_asset(&self, id: AssetId) -> DomainResult<Asset> {
        self.load_asset(id).await?.ok_or(DomainError::AssetNotFound(id))
    }

    /// Public URL as consumers would see it right now.
    pub fn public_url(&self, asset: &Asset) -> String {
        if asset.flags.migrated {
            if let Some(url) = &asset.flags.bunny_url {
                return match &asset.flags.version_hash {
                    Some(token) => versioned_url(url, token),
                    None => url.clone(),
                };
            }
        }
        if let Some(url) = &asset.flags.public_url {
            return url.clone();
        }
        self.config.local_url(&asset.file_path)
    }

    /// Every variant file of the asset that physically exists next to its primary file.
    pub async fn local_variants(&self, id: AssetId) -> DomainResult<Vec<String>> {
        let asset = self.require_asset(id).await?;
        Ok(discover_variants(self.storage.as_ref(), &asset.file_path).await?)
    }

    pub async fn set_flags(&self, id: AssetId, flags: &[(AssetFlag, String)]) -> DomainResult<()> {
        self.assets.set_flags(id, flags).await?;
        self.invalidate_asset(id).await;
        Ok(())
    }

    pub async fn delete_flags(&self, id: AssetId, flags: &[AssetFlag]) -> DomainResult<()> {
        self.assets.delete_flags(id, flags).await?;
        self.invalidate_asset(id).await;
        Ok(())
    }

    pub async fn update_primary_file(
        &self,
        id: AssetId,
        old_relative: &str,
        new_relative: &str,
        mime_type: &str,
    ) -> DomainResult<()> {
        self.assets.update_primary_file(id, new_relative, mime_type).await?;
        self.path_cache.invalidate(old_relative).await;
        self.invalidate_asset(id).await;
        Ok(())
    }

    pub async fn record_variant(&self, id: AssetId, variant: &SizeVariant) -> DomainResult<()> {
        self.assets.upsert_size_variant(id, variant).await?;
        self.invalidate_asset(id).await;
        Ok(())
    }

    pub async fn invalidate_asset(&self, id: AssetId) {
        self.asset_cache.invalidate(&id.to_string()).await;
        self.stats_cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathMapping;
    use crate::db_migration::test_pool;
    use crate::domains::asset::repository::SqliteAssetRepository;
    use crate::domains::core::cache::NoopCache;
    use crate::domains::core::file_storage_service::LocalFileStorageService;
    use tempfile::TempDir;

    async fn setup(config: OffloadConfig) -> (TempDir, Arc<SqliteAssetRepository>, AttachmentResolver) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(LocalFileStorageService::new(dir.path()).unwrap());
        let repo = Arc::new(SqliteAssetRepository::new(test_pool().await));
        let resolver = AttachmentResolver::with_default_caches(
            Arc::new(config),
            repo.clone(),
            storage,
            Arc::new(NoopCache),
        );
        (dir, repo, resolver)
    }

    #[tokio::test]
    async fn test_exact_match_then_file_name_fallback() {
        let (_dir, repo, resolver) = setup(OffloadConfig::default()).await;
        let id = repo.create_asset("2024/05/photo.jpg", "image/jpeg", &[]).await.unwrap();

        let absolute = resolver.storage().get_absolute_path("2024/05/photo.jpg");
        assert_eq!(resolver.resolve(absolute.to_str().unwrap()).await.unwrap(), Some(id));

        // Same file name recorded under another directory.
        assert_eq!(resolver.resolve("2019/01/photo.jpg").await.unwrap(), Some(id));
        assert_eq!(resolver.resolve("2019/01/missing.jpg").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_normalize_path_handles_drift() {
        let config = OffloadConfig {
            path_mappings: vec![PathMapping { from: "/srv/dev/uploads".into(), to: String::new() }],
            ..OffloadConfig::default()
        };
        let (_dir, _repo, resolver) = setup(config).await;

        assert_eq!(resolver.normalize_path("2024/05/a.jpg").as_deref(), Some("2024/05/a.jpg"));
        assert_eq!(
            resolver.normalize_path("/var/www/other/uploads/2024/05/a.jpg").as_deref(),
            Some("2024/05/a.jpg")
        );
        assert_eq!(resolver.normalize_path("/var/www/other/a.jpg"), None);
        assert_eq!(resolver.normalize_path("   "), None);
    }

    #[tokio::test]
    async fn test_normalize_relative_path_with_prefix() {
        let config = OffloadConfig {
            path_mappings: vec![PathMapping { from: "media/".into(), to: "library/".into() }],
            ..OffloadConfig::default()
        };
        let (_dir, _repo, resolver) = setup(config).await;
        resolver.storage().write_file_atomic("library/logo.png", vec![1u8; 8]).await.unwrap();

        assert_eq!(
            resolver.normalize_path("wp-content/uploads/2024/05/a.jpg").as_deref(),
            Some("2024/05/a.jpg")
        );
        assert_eq!(resolver.normalize_path("media/logo.png").as_deref(), Some("library/logo.png"));
        // Nothing else applies: the cleaned relative path is kept.
        assert_eq!(resolver.normalize_path("./misc/a.jpg").as_deref(), Some("misc/a.jpg"));
    }

    #[tokio::test]
    async fn test_resolve_batch_mixes_exact_and_fallback() {
        let (_dir, repo, resolver) = setup(OffloadConfig::default()).await;
        let a = repo.create_asset("2024/05/a.jpg", "image/jpeg", &[]).await.unwrap();
        let b = repo.create_asset("2024/06/b.png", "image/png", &[]).await.unwrap();

        let paths = vec!["2024/05/a.jpg".to_string(), "old/b.png".to_string(), "2024/05/zzz.gif".to_string()];
        let resolved = resolver.resolve_batch(&paths).await.unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved["2024/05/a.jpg"], a);
        assert_eq!(resolved["old/b.png"], b);
    }

    #[tokio::test]
    async fn test_flag_writes_invalidate_cached_asset() {
        let (_dir, repo, resolver) = setup(OffloadConfig::default()).await;
        let id = repo.create_asset("2024/05/a.jpg", "image/jpeg", &[]).await.unwrap();

        assert!(!resolver.require_asset(id).await.unwrap().flags.optimized);
        resolver.set_flags(id, &[(AssetFlag::Optimized, "1".into())]).await.unwrap();
        assert!(resolver.require_asset(id).await.unwrap().flags.optimized);
    }

    #[tokio::test]
    async fn test_public_url_prefers_flagged_remote_url() {
        let (_dir, repo, resolver) = setup(OffloadConfig::default()).await;
        let id = repo.create_asset("2024/05/a.jpg", "image/jpeg", &[]).await.unwrap();
        assert_eq!(
            resolver.public_url(&resolver.require_asset(id).await.unwrap()),
            "http://localhost/uploads/2024/05/a.jpg"
        );

        resolver
            .set_flags(id, &[
                (AssetFlag::Migrated, "1".into()),
                (AssetFlag::BunnyUrl, "https://z.b-cdn.net/2024/05/a.jpg".into()),
            ])
            .await
            .unwrap();
        assert_eq!(
            resolver.public_url(&resolver.require_asset(id).await.unwrap()),
            "https://z.b-cdn.net/2024/05/a.jpg"
        );
    }
}
