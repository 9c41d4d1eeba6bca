//! Named work queue over the queue repository.

use std::sync::Arc;

use crate::errors::DomainResult;
use super::repository::QueueRepository;
use super::types::{BatchOutcome, BatchProcessor, QueueEntry, QueueName};

/// Result of one `WorkQueue::process` call.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// Entries offered to the processor, in queue order.
    pub batch: Vec<QueueEntry>,
    pub outcome: BatchOutcome,
    pub removed: usize,
}

#[derive(Clone)]
pub struct WorkQueue {
    name: QueueName,
    repo: Arc<dyn QueueRepository>,
}

impl WorkQueue {
    pub fn new(name: QueueName, repo: Arc<dyn QueueRepository>) -> Self {
        Self { name, repo }
    }

    pub fn name(&self) -> QueueName {
        self.name
    }

    pub async fn add(&self, path: &str) -> DomainResult<bool> {
        let added = self.repo.add(self.name, path).await?;
        if added {
            log::debug!("Queued {} for {}", path, self.name);
        }
        Ok(added)
    }

    pub async fn add_batch(&self, paths: &[String]) -> DomainResult<usize> {
        let added = self.repo.add_batch(self.name, paths).await?;
        log::debug!("Queued {} of {} paths for {}", added, paths.len(), self.name);
        Ok(added)
    }

    pub async fn get_batch(&self, n: usize) -> DomainResult<Vec<String>> {
        Ok(self
            .repo
            .get_batch(self.name, n)
            .await?
            .into_iter()
            .map(|entry| entry.path)
            .collect())
    }

    pub async fn get_entries(&self, n: usize) -> DomainResult<Vec<QueueEntry>> {
        self.repo.get_batch(self.name, n).await
    }

    pub async fn remove_batch(&self, paths: &[String]) -> DomainResult<usize> {
        self.repo.remove_batch(self.name, paths).await
    }

    pub async fn remove(&self, path: &str) -> DomainResult<bool> {
        Ok(self.repo.remove_batch(self.name, &[path.to_string()]).await? > 0)
    }

    pub async fn clear(&self) -> DomainResult<()> {
        self.repo.clear(self.name).await?;
        log::info!("Cleared {} queue", self.name);
        Ok(())
    }

    pub async fn size(&self) -> DomainResult<usize> {
        self.repo.size(self.name).await
    }

    pub async fn get_all(&self) -> DomainResult<Vec<String>> {
        Ok(self
            .repo
            .entries(self.name)
            .await?
            .into_iter()
            .map(|entry| entry.path)
            .collect())
    }

    pub async fn contains(&self, path: &str) -> DomainResult<bool> {
        self.repo.contains(self.name, path).await
    }

    /// Records one failed attempt and returns the new count.
    pub async fn retry_count(&self, path: &str) -> DomainResult<u32> {
        self.repo.increment_retry(self.name, path).await
    }

    pub async fn reset_retry_count(&self, path: &str) -> DomainResult<()> {
        self.repo.reset_retry(self.name, path).await
    }

    /// Offers one batch from the head to `processor` and dequeues what it completed.
    ///
    /// Succeeded and permanently ineligible paths leave the queue. Failed paths stay;
    /// their retry counters are the caller's business.
    pub async fn process(&self, processor: &dyn BatchProcessor, batch_size: usize) -> DomainResult<ProcessOutcome> {
        let batch = self.repo.get_batch(self.name, batch_size.max(1)).await?;
        if batch.is_empty() {
            return Ok(ProcessOutcome {
                batch,
                outcome: BatchOutcome::Processed(Default::default()),
                removed: 0,
            });
        }

        let paths: Vec<String> = batch.iter().map(|entry| entry.path.clone()).collect();
        log::info!("Processing {} batch of {} item(s)", self.name, paths.len());

        let outcome = processor.process_batch(&paths).await;
        let removed = match &outcome {
            BatchOutcome::Processed(report) => self.remove_batch(&report.completed_paths()).await?,
            BatchOutcome::NotConfigured { message } => {
                log::warn!("{} batch refused: {}", self.name, message);
                0
            }
            BatchOutcome::Failed { reason } => {
                log::warn!("{} batch failed: {}", self.name, reason);
                0
            }
        };

        Ok(ProcessOutcome { batch, outcome, removed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_migration::test_pool;
    use crate::domains::queue::repository::SqliteQueueRepository;
    use crate::domains::queue::types::BatchReport;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Succeeds on `.png`, marks `.gif` ineligible, fails the rest.
    struct ScriptedProcessor {
        seen: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl BatchProcessor for ScriptedProcessor {
        async fn process_batch(&self, paths: &[String]) -> BatchOutcome {
            self.seen.lock().unwrap().push(paths.to_vec());
            let mut report = BatchReport::default();
            for path in paths {
                if path.ends_with(".png") {
                    report.succeed(path, format!("{} done", path));
                } else if path.ends_with(".gif") {
                    report.skip_ineligible(path, "unsupported".into());
                } else {
                    report.fail(path, "remote error".into());
                }
            }
            BatchOutcome::Processed(report)
        }
    }

    struct FailingProcessor;

    #[async_trait]
    impl BatchProcessor for FailingProcessor {
        async fn process_batch(&self, _paths: &[String]) -> BatchOutcome {
            BatchOutcome::Failed { reason: "timeout".into() }
        }
    }

    async fn queue() -> WorkQueue {
        let repo = Arc::new(SqliteQueueRepository::new(test_pool().await));
        WorkQueue::new(QueueName::Optimization, repo)
    }

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_process_removes_only_completed() {
        let queue = queue().await;
        queue.add_batch(&paths(&["a.png", "b.jpg", "c.gif", "d.png"])).await.unwrap();
        let processor = ScriptedProcessor { seen: Mutex::new(Vec::new()) };

        let result = queue.process(&processor, 3).await.unwrap();
        assert_eq!(result.batch.len(), 3);
        assert_eq!(result.removed, 2);
        assert_eq!(result.outcome.success_count(), Some(1));
        assert_eq!(queue.get_all().await.unwrap(), paths(&["b.jpg", "d.png"]));
        assert_eq!(processor.seen.lock().unwrap()[0], paths(&["a.png", "b.jpg", "c.gif"]));
    }

    #[tokio::test]
    async fn test_failed_batch_keeps_everything() {
        let queue = queue().await;
        queue.add_batch(&paths(&["a.png", "b.png"])).await.unwrap();

        let result = queue.process(&FailingProcessor, 5).await.unwrap();
        assert_eq!(result.removed, 0);
        assert_eq!(queue.size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_queue_processes_nothing() {
        let queue = queue().await;
        let processor = ScriptedProcessor { seen: Mutex::new(Vec::new()) };
        let result = queue.process(&processor, 5).await.unwrap();
        assert!(result.batch.is_empty());
        assert!(processor.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_count_increments_per_call() {
        let queue = queue().await;
        queue.add("a.jpg").await.unwrap();
        assert_eq!(queue.retry_count("a.jpg").await.unwrap(), 1);
        assert_eq!(queue.retry_count("a.jpg").await.unwrap(), 2);
        queue.reset_retry_count("a.jpg").await.unwrap();
        assert_eq!(queue.retry_count("a.jpg").await.unwrap(), 1);
    }
}
