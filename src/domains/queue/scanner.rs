//! Populates a work queue from the asset population.

use std::sync::Arc;

use crate::domains::asset::repository::AssetRepository;
use crate::domains::core::file_storage_service::FileStorageService;
use crate::errors::DomainResult;
use super::service::WorkQueue;
use super::types::EligibilityCheck;

pub struct QueueScanner {
    assets: Arc<dyn AssetRepository>,
    storage: Arc<dyn FileStorageService>,
    chunk_size: usize,
}

impl QueueScanner {
    pub fn new(assets: Arc<dyn AssetRepository>, storage: Arc<dyn FileStorageService>, chunk_size: usize) -> Self {
        Self {
            assets,
            storage,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Walks every image asset in chunks and queues the eligible primary files.
    ///
    /// Always starts from offset 0. Interrupted scans are simply re-run, since
    /// adding an already queued path is a no-op. Returns the number of newly queued paths.
    pub async fn scan(&self, queue: &WorkQueue, check: &dyn EligibilityCheck) -> DomainResult<usize> {
        let mut offset = 0i64;
        let mut added = 0usize;
        let mut inspected = 0usize;

        loop {
            let chunk = self.assets.list_image_assets(offset, self.chunk_size as i64).await?;
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as i64;
            inspected += chunk.len();

            let mut eligible = Vec::new();
            for summary in &chunk {
                let path = self
                    .storage
                    .get_absolute_path(&summary.file_path)
                    .to_string_lossy()
                    .into_owned();
                if check.is_eligible(&path).await {
                    eligible.push(path);
                }
            }

            if !eligible.is_empty() {
                added += queue.add_batch(&eligible).await?;
            }
        }

        log::info!(
            "Scan for {} inspected {} asset(s), queued {} new path(s)",
            queue.name(), inspected, added
        );
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_migration::test_pool;
    use crate::domains::asset::repository::SqliteAssetRepository;
    use crate::domains::core::file_storage_service::LocalFileStorageService;
    use crate::domains::queue::repository::SqliteQueueRepository;
    use crate::domains::queue::types::QueueName;
    use async_trait::async_trait;

    struct JpegOnly;

    #[async_trait]
    impl EligibilityCheck for JpegOnly {
        async fn is_eligible(&self, path: &str) -> bool {
            path.ends_with(".jpg")
        }
    }

    #[tokio::test]
    async fn test_scan_is_chunked_and_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = test_pool().await;
        let assets = Arc::new(SqliteAssetRepository::new(pool.clone()));
        let storage = Arc::new(LocalFileStorageService::new(dir.path()).unwrap());
        for i in 0..7 {
            assets.create_asset(&format!("2024/05/{}.jpg", i), "image/jpeg", &[]).await.unwrap();
        }
        assets.create_asset("2024/05/x.png", "image/png", &[]).await.unwrap();

        let queue = WorkQueue::new(QueueName::Optimization, Arc::new(SqliteQueueRepository::new(pool)));
        let scanner = QueueScanner::new(assets, storage.clone(), 3);

        assert_eq!(scanner.scan(&queue, &JpegOnly).await.unwrap(), 7);
        assert_eq!(scanner.scan(&queue, &JpegOnly).await.unwrap(), 0);
        assert_eq!(queue.size().await.unwrap(), 7);

        let first = queue.get_batch(1).await.unwrap().remove(0);
        assert_eq!(storage.relative_path(&first).as_deref(), Some("2024/05/0.jpg"));
    }
}
