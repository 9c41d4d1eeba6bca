//! Persistence for the work queues.
//!
//! Each mutation is a single transaction, so concurrent adds and removes
//! against the same queue never interleave.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, QueryBuilder, Sqlite, Transaction};

use crate::errors::{DbError, DomainResult};
use super::types::{QueueEntry, QueueName};

const BIND_CHUNK: usize = 500;

#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Appends a path. Returns false when it is already queued.
    async fn add(&self, queue: QueueName, path: &str) -> DomainResult<bool>;

    /// Appends every path not already queued. Returns how many were added.
    async fn add_batch(&self, queue: QueueName, paths: &[String]) -> DomainResult<usize>;

    /// Up to `limit` entries from the head, in insertion order. Does not dequeue.
    async fn get_batch(&self, queue: QueueName, limit: usize) -> DomainResult<Vec<QueueEntry>>;

    /// Removes the given paths. Returns how many rows were actually removed.
    async fn remove_batch(&self, queue: QueueName, paths: &[String]) -> DomainResult<usize>;

    async fn clear(&self, queue: QueueName) -> DomainResult<()>;

    async fn size(&self, queue: QueueName) -> DomainResult<usize>;

    async fn entries(&self, queue: QueueName) -> DomainResult<Vec<QueueEntry>>;

    async fn contains(&self, queue: QueueName, path: &str) -> DomainResult<bool>;

    /// Increments and returns the retry counter. Returns 0 when the path is not queued.
    async fn increment_retry(&self, queue: QueueName, path: &str) -> DomainResult<u32>;

    async fn reset_retry(&self, queue: QueueName, path: &str) -> DomainResult<()>;
}

pub struct SqliteQueueRepository {
    pool: Pool<Sqlite>,
}

impl SqliteQueueRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    async fn insert_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        queue: QueueName,
        path: &str,
        now: &str,
    ) -> DomainResult<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO work_queue (queue_name, path, position, retry_count, enqueued_at)
             VALUES (?, ?, (SELECT COALESCE(MAX(position), 0) + 1 FROM work_queue WHERE queue_name = ?), 0, ?)"
        )
        .bind(queue.as_str())
        .bind(path)
        .bind(queue.as_str())
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(result.rows_affected() > 0)
    }
}

fn to_entry((path, retry_count): (String, i64)) -> QueueEntry {
    QueueEntry {
        path,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
    }
}

#[async_trait]
impl QueueRepository for SqliteQueueRepository {
    async fn add(&self, queue: QueueName, path: &str) -> DomainResult<bool> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let now_str = Utc::now().to_rfc3339();
        let added = Self::insert_in_tx(&mut tx, queue, path, &now_str).await?;
        tx.commit().await.map_err(DbError::from)?;
        Ok(added)
    }

    async fn add_batch(&self, queue: QueueName, paths: &[String]) -> DomainResult<usize> {
        if paths.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let now_str = Utc::now().to_rfc3339();

        let mut added = 0;
        for path in paths {
            if Self::insert_in_tx(&mut tx, queue, path, &now_str).await? {
                added += 1;
            }
        }

        if added > 0 {
            tx.commit().await.map_err(DbError::from)?;
        } else {
            tx.rollback().await.map_err(DbError::from)?;
        }
        Ok(added)
    }

    async fn get_batch(&self, queue: QueueName, limit: usize) -> DomainResult<Vec<QueueEntry>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT path, retry_count FROM work_queue
             WHERE queue_name = ? ORDER BY position LIMIT ?"
        )
        .bind(queue.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(rows.into_iter().map(to_entry).collect())
    }

    async fn remove_batch(&self, queue: QueueName, paths: &[String]) -> DomainResult<usize> {
        if paths.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let mut removed = 0u64;

        for chunk in paths.chunks(BIND_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("DELETE FROM work_queue WHERE queue_name = ");
            builder.push_bind(queue.as_str());
            builder.push(" AND path IN (");
            let mut separated = builder.separated(", ");
            for path in chunk {
                separated.push_bind(path);
            }
            separated.push_unseparated(")");

            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(DbError::from)?;
            removed += result.rows_affected();
        }

        if removed > 0 {
            tx.commit().await.map_err(DbError::from)?;
        } else {
            tx.rollback().await.map_err(DbError::from)?;
        }
        Ok(removed as usize)
    }

    async fn clear(&self, queue: QueueName) -> DomainResult<()> {
        sqlx::query("DELETE FROM work_queue WHERE queue_name = ?")
            .bind(queue.as_str())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn size(&self, queue: QueueName) -> DomainResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM work_queue WHERE queue_name = ?")
            .bind(queue.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(count as usize)
    }

    async fn entries(&self, queue: QueueName) -> DomainResult<Vec<QueueEntry>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT path, retry_count FROM work_queue WHERE queue_name = ? ORDER BY position"
        )
        .bind(queue.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(rows.into_iter().map(to_entry).collect())
    }

    async fn contains(&self, queue: QueueName, path: &str) -> DomainResult<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM work_queue WHERE queue_name = ? AND path = ?"
        )
        .bind(queue.as_str())
        .bind(path)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(found.is_some())
    }

    async fn increment_retry(&self, queue: QueueName, path: &str) -> DomainResult<u32> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        sqlx::query(
            "UPDATE work_queue SET retry_count = retry_count + 1 WHERE queue_name = ? AND path = ?"
        )
        .bind(queue.as_str())
        .bind(path)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        let count: Option<i64> = sqlx::query_scalar(
            "SELECT retry_count FROM work_queue WHERE queue_name = ? AND path = ?"
        )
        .bind(queue.as_str())
        .bind(path)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::from)?;

        tx.commit().await.map_err(DbError::from)?;
        Ok(count.and_then(|c| u32::try_from(c).ok()).unwrap_or(0))
    }

    async fn reset_retry(&self, queue: QueueName, path: &str) -> DomainResult<()> {
        sqlx::query("UPDATE work_queue SET retry_count = 0 WHERE queue_name = ? AND path = ?")
            .bind(queue.as_str())
            .bind(path)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }
}
