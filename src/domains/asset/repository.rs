//! Asset store: primary paths, size variants and per-asset flags.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, QueryBuilder, Sqlite};
use std::collections::HashMap;

use crate::errors::{DbError, DomainError, DomainResult};
use super::types::{Asset, AssetFlag, AssetFlags, AssetId, AssetSummary, SizeVariant};

/// SQLite limits bound parameters per statement; batch lookups are chunked below it.
const LOOKUP_CHUNK: usize = 500;

#[async_trait]
pub trait AssetRepository: Send + Sync {
    /// Register an asset (normally done by the host CMS)
    async fn create_asset(
        &self,
        file_path: &str,
        mime_type: &str,
        variants: &[SizeVariant],
    ) -> DomainResult<AssetId>;

    /// Full record: primary path, mime type, variants and decoded flags
    async fn get_asset(&self, id: AssetId) -> DomainResult<Option<Asset>>;

    async fn get_primary_path(&self, id: AssetId) -> DomainResult<Option<String>>;

    async fn get_mime_type(&self, id: AssetId) -> DomainResult<Option<String>>;

    async fn get_size_variants(&self, id: AssetId) -> DomainResult<Vec<SizeVariant>>;

    async fn get_flag(&self, id: AssetId, flag: AssetFlag) -> DomainResult<Option<String>>;

    async fn set_flag(&self, id: AssetId, flag: AssetFlag, value: &str) -> DomainResult<()>;

    async fn delete_flag(&self, id: AssetId, flag: AssetFlag) -> DomainResult<()>;

    /// Set several flags in one transaction
    async fn set_flags(&self, id: AssetId, flags: &[(AssetFlag, String)]) -> DomainResult<()>;

    /// Delete several flags in one transaction
    async fn delete_flags(&self, id: AssetId, flags: &[AssetFlag]) -> DomainResult<()>;

    /// Exact match on the recorded relative primary path
    async fn find_by_path(&self, relative_path: &str) -> DomainResult<Option<AssetId>>;

    async fn find_by_path_batch(&self, relative_paths: &[String]) -> DomainResult<HashMap<String, AssetId>>;

    /// Assets whose primary file has this bare file name, in any directory
    async fn find_by_file_name(&self, file_name: &str) -> DomainResult<Vec<(AssetId, String)>>;

    /// Image assets ordered by id, for chunked walks
    async fn list_image_assets(&self, offset: i64, limit: i64) -> DomainResult<Vec<AssetSummary>>;

    async fn count_image_assets(&self) -> DomainResult<i64>;

    /// Point the asset at a new primary file (after a format conversion)
    async fn update_primary_file(&self, id: AssetId, relative_path: &str, mime_type: &str) -> DomainResult<()>;

    /// Insert or replace a size variant
    async fn upsert_size_variant(&self, id: AssetId, variant: &SizeVariant) -> DomainResult<()>;
}

pub struct SqliteAssetRepository {
    pool: Pool<Sqlite>,
}

impl SqliteAssetRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    async fn load_flags(&self, id: AssetId) -> DomainResult<HashMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT flag_key, flag_value FROM asset_flags WHERE asset_id = ?"
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(rows.into_iter().collect())
    }
}

/// Escapes LIKE wildcards so file names containing `%` or `_` match literally.
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn to_u32(value: Option<i64>) -> Option<u32> {
    value.and_then(|v| u32::try_from(v).ok())
}

#[async_trait]
impl AssetRepository for SqliteAssetRepository {
    async fn create_asset(
        &self,
        file_path: &str,
        mime_type: &str,
        variants: &[SizeVariant],
    ) -> DomainResult<AssetId> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let result = sqlx::query("INSERT INTO assets (file_path, mime_type) VALUES (?, ?)")
            .bind(file_path)
            .bind(mime_type)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?;
        let id = result.last_insert_rowid();

        for variant in variants {
            sqlx::query(
                "INSERT OR REPLACE INTO asset_variants (asset_id, size_name, file_name, width, height)
                 VALUES (?, ?, ?, ?, ?)"
            )
            .bind(id)
            .bind(&variant.name)
            .bind(&variant.file_name)
            .bind(variant.width.map(i64::from))
            .bind(variant.height.map(i64::from))
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?;
        }

        tx.commit().await.map_err(DbError::from)?;
        Ok(id)
    }

    async fn get_asset(&self, id: AssetId) -> DomainResult<Option<Asset>> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT file_path, mime_type FROM assets WHERE id = ?"
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        let (file_path, mime_type) = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let variants = self.get_size_variants(id).await?;
        let flags = AssetFlags::from_raw(&self.load_flags(id).await?);

        Ok(Some(Asset {
            id,
            file_path,
            mime_type,
            variants,
            flags,
        }))
    }

    async fn get_primary_path(&self, id: AssetId) -> DomainResult<Option<String>> {
        let path: Option<String> = sqlx::query_scalar("SELECT file_path FROM assets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(path)
    }

    async fn get_mime_type(&self, id: AssetId) -> DomainResult<Option<String>> {
        let mime: Option<String> = sqlx::query_scalar("SELECT mime_type FROM assets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(mime)
    }

    async fn get_size_variants(&self, id: AssetId) -> DomainResult<Vec<SizeVariant>> {
        let rows: Vec<(String, String, Option<i64>, Option<i64>)> = sqlx::query_as(
            "SELECT size_name, file_name, width, height FROM asset_variants
             WHERE asset_id = ? ORDER BY size_name"
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(rows
            .into_iter()
            .map(|(name, file_name, width, height)| SizeVariant {
                name,
                file_name,
                width: to_u32(width),
                height: to_u32(height),
            })
            .collect())
    }

    async fn get_flag(&self, id: AssetId, flag: AssetFlag) -> DomainResult<Option<String>> {
        let value: Option<String> = sqlx::query_scalar(
            "SELECT flag_value FROM asset_flags WHERE asset_id = ? AND flag_key = ?"
        )
        .bind(id)
        .bind(flag.key())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(value)
    }

    async fn set_flag(&self, id: AssetId, flag: AssetFlag, value: &str) -> DomainResult<()> {
        self.set_flags(id, &[(flag, value.to_string())]).await
    }

    async fn delete_flag(&self, id: AssetId, flag: AssetFlag) -> DomainResult<()> {
        self.delete_flags(id, &[flag]).await
    }

    async fn set_flags(&self, id: AssetId, flags: &[(AssetFlag, String)]) -> DomainResult<()> {
        if flags.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let now_str = Utc::now().to_rfc3339();

        for (flag, value) in flags {
            sqlx::query(
                "INSERT INTO asset_flags (asset_id, flag_key, flag_value, updated_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(asset_id, flag_key) DO UPDATE SET
                    flag_value = excluded.flag_value,
                    updated_at = excluded.updated_at"
            )
            .bind(id)
            .bind(flag.key())
            .bind(value)
            .bind(&now_str)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?;
        }

        tx.commit().await.map_err(DbError::from)?;
        Ok(())
    }

    async fn delete_flags(&self, id: AssetId, flags: &[AssetFlag]) -> DomainResult<()> {
        if flags.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        for flag in flags {
            sqlx::query("DELETE FROM asset_flags WHERE asset_id = ? AND flag_key = ?")
                .bind(id)
                .bind(flag.key())
                .execute(&mut *tx)
                .await
                .map_err(DbError::from)?;
        }

        tx.commit().await.map_err(DbError::from)?;
        Ok(())
    }

    async fn find_by_path(&self, relative_path: &str) -> DomainResult<Option<AssetId>> {
        let id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM assets WHERE file_path = ? ORDER BY id LIMIT 1"
        )
        .bind(relative_path)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(id)
    }

    async fn find_by_path_batch(&self, relative_paths: &[String]) -> DomainResult<HashMap<String, AssetId>> {
        let mut found = HashMap::new();

        for chunk in relative_paths.chunks(LOOKUP_CHUNK) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT file_path, id FROM assets WHERE file_path IN (");
            let mut separated = builder.separated(", ");
            for path in chunk {
                separated.push_bind(path);
            }
            separated.push_unseparated(") ORDER BY id DESC");

            let rows: Vec<(String, i64)> = builder
                .build_query_as()
                .fetch_all(&self.pool)
                .await
                .map_err(DbError::from)?;

            // Descending order lets the lowest id win for duplicated paths.
            for (path, id) in rows {
                found.insert(path, id);
            }
        }

        Ok(found)
    }

    async fn find_by_file_name(&self, file_name: &str) -> DomainResult<Vec<(AssetId, String)>> {
        if file_name.is_empty() || file_name.contains('/') {
            return Err(DomainError::Internal(format!("Invalid file name for lookup: '{}'", file_name)));
        }
        let pattern = format!("%/{}", escape_like(file_name));

        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, file_path FROM assets
             WHERE file_path = ? OR file_path LIKE ? ESCAPE '\\'
             ORDER BY id"
        )
        .bind(file_name)
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(rows)
    }

    async fn list_image_assets(&self, offset: i64, limit: i64) -> DomainResult<Vec<AssetSummary>> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            "SELECT id, file_path, mime_type FROM assets
             WHERE mime_type LIKE 'image/%'
             ORDER BY id
             LIMIT ? OFFSET ?"
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(rows
            .into_iter()
            .map(|(id, file_path, mime_type)| AssetSummary { id, file_path, mime_type })
            .collect())
    }

    async fn count_image_assets(&self) -> DomainResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM assets WHERE mime_type LIKE 'image/%'")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(count)
    }

    async fn update_primary_file(&self, id: AssetId, relative_path: &str, mime_type: &str) -> DomainResult<()> {
        let result = sqlx::query("UPDATE assets SET file_path = ?, mime_type = ? WHERE id = ?")
            .bind(relative_path)
            .bind(mime_type)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::AssetNotFound(id));
        }
        Ok(())
    }

    async fn upsert_size_variant(&self, id: AssetId, variant: &SizeVariant) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO asset_variants (asset_id, size_name, file_name, width, height)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(asset_id, size_name) DO UPDATE SET
                file_name = excluded.file_name,
                width = excluded.width,
                height = excluded.height"
        )
        .bind(id)
        .bind(&variant.name)
        .bind(&variant.file_name)
        .bind(variant.width.map(i64::from))
        .bind(variant.height.map(i64::from))
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }
}
