//! Rewrites stored references from one URL to another.
//!
//! Content bodies are rewritten as plain text. Metadata values that decode as
//! JSON are walked down to their string leaves, rewritten, and re-encoded;
//! anything else is rewritten as plain text.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Pool, Sqlite};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::errors::{DbError, DomainResult};

/// Structured fields written by page builders, scanned even when their
/// encoded form hides the URL (escaped slashes).
pub const PAGE_BUILDER_KEYS: [&str; 4] = [
    "_elementor_data",
    "brizy_post_data",
    "_et_pb_post_settings",
    "_fl_builder_data",
];

/// Meta keys owned by the media records themselves; never rewritten.
pub const EXCLUDED_META_KEYS: [&str; 1] = ["_wp_attachment_metadata"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlReplacement {
    pub from: String,
    pub to: String,
}

impl UrlReplacement {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self { from: from.into(), to: to.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRecord {
    pub id: i64,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaRecord {
    pub id: i64,
    pub owner_id: i64,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteSummary {
    pub content_updated: usize,
    pub meta_updated: usize,
}

/// Stored text fields that may reference asset URLs.
#[async_trait]
pub trait ContentRepository: Send + Sync {
    async fn find_content_containing(&self, needle: &str) -> DomainResult<Vec<ContentRecord>>;

    async fn find_meta_containing(&self, needle: &str, excluded_keys: &[&str]) -> DomainResult<Vec<MetaRecord>>;

    async fn find_meta_by_key(&self, key: &str) -> DomainResult<Vec<MetaRecord>>;

    /// Writes new content bodies and meta values in one transaction.
    async fn apply_updates(&self, bodies: &[(i64, String)], metas: &[(i64, String)]) -> DomainResult<()>;
}

/// Replaces every URL substring in the string leaves of `value`.
/// Returns whether anything changed.
pub fn replace_in_value(value: &mut Value, replacements: &[UrlReplacement]) -> bool {
    match value {
        Value::String(text) => match replace_in_text(text, replacements) {
            Some(updated) => {
                *text = updated;
                true
            }
            None => false,
        },
        Value::Array(items) => {
            let mut changed = false;
            for item in items.iter_mut() {
                changed |= replace_in_value(item, replacements);
            }
            changed
        }
        Value::Object(map) => {
            let mut changed = false;
            for item in map.values_mut() {
                changed |= replace_in_value(item, replacements);
            }
            changed
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Plain substring replacement; `None` when nothing matched.
pub fn replace_in_text(text: &str, replacements: &[UrlReplacement]) -> Option<String> {
    let mut updated: Option<String> = None;
    for replacement in replacements {
        if replacement.from.is_empty() || replacement.from == replacement.to {
            continue;
        }
        let current = updated.as_deref().unwrap_or(text);
        if current.contains(replacement.from.as_str()) {
            updated = Some(current.replace(replacement.from.as_str(), &replacement.to));
        }
    }
    updated
}

/// Rewrites a stored value, round-tripping through JSON when it is a structure.
pub fn rewrite_stored_value(raw: &str, replacements: &[UrlReplacement]) -> Option<String> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(mut value) = serde_json::from_str::<Value>(raw) {
            return if replace_in_value(&mut value, replacements) {
                serde_json::to_string(&value).ok()
            } else {
                None
            };
        }
    }
    replace_in_text(raw, replacements)
}

/// Longest source first, so a URL is never rewritten through a shorter prefix of itself.
fn ordered(replacements: &[UrlReplacement]) -> Vec<UrlReplacement> {
    let mut ordered: Vec<UrlReplacement> = replacements
        .iter()
        .filter(|r| !r.from.is_empty() && r.from != r.to)
        .cloned()
        .collect();
    ordered.sort_by(|a, b| b.from.len().cmp(&a.from.len()).then_with(|| a.from.cmp(&b.from)));
    ordered.dedup_by(|a, b| a.from == b.from);
    ordered
}

pub struct ReferenceRewriter {
    repo: Arc<dyn ContentRepository>,
}

impl ReferenceRewriter {
    pub fn new(repo: Arc<dyn ContentRepository>) -> Self {
        Self { repo }
    }

    /// Rewrites content bodies, other stored fields and page-builder data.
    pub async fn rewrite(&self, replacements: &[UrlReplacement]) -> DomainResult<RewriteSummary> {
        let replacements = ordered(replacements);
        let mut summary = RewriteSummary::default();
        if replacements.is_empty() {
            return Ok(summary);
        }

        let mut bodies: BTreeMap<i64, String> = BTreeMap::new();
        for replacement in &replacements {
            for record in self.repo.find_content_containing(&replacement.from).await? {
                bodies.entry(record.id).or_insert(record.body);
            }
        }
        let body_updates: Vec<(i64, String)> = bodies
            .into_iter()
            .filter_map(|(id, body)| replace_in_text(&body, &replacements).map(|updated| (id, updated)))
            .collect();

        let mut metas: BTreeMap<i64, MetaRecord> = BTreeMap::new();
        for replacement in &replacements {
            for record in self.repo.find_meta_containing(&replacement.from, &EXCLUDED_META_KEYS).await? {
                metas.entry(record.id).or_insert(record);
            }
        }
        for key in PAGE_BUILDER_KEYS {
            for record in self.repo.find_meta_by_key(key).await? {
                metas.entry(record.id).or_insert(record);
            }
        }
        let meta_updates: Vec<(i64, String)> = metas
            .values()
            .filter_map(|record| {
                rewrite_stored_value(&record.value, &replacements).map(|updated| (record.id, updated))
            })
            .collect();

        if !body_updates.is_empty() || !meta_updates.is_empty() {
            self.repo.apply_updates(&body_updates, &meta_updates).await?;
        }
        summary.content_updated = body_updates.len();
        summary.meta_updated = meta_updates.len();

        if summary.content_updated + summary.meta_updated > 0 {
            log::info!(
                "Rewrote references: {} content item(s), {} meta value(s)",
                summary.content_updated,
                summary.meta_updated
            );
        }
        Ok(summary)
    }
}

pub struct SqliteContentRepository {
    pool: Pool<Sqlite>,
}

impl SqliteContentRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContentRepository for SqliteContentRepository {
    async fn find_content_containing(&self, needle: &str) -> DomainResult<Vec<ContentRecord>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, body FROM content_items WHERE instr(body, ?) > 0 ORDER BY id"
        )
        .bind(needle)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(rows.into_iter().map(|(id, body)| ContentRecord { id, body }).collect())
    }

    async fn find_meta_containing(&self, needle: &str, excluded_keys: &[&str]) -> DomainResult<Vec<MetaRecord>> {
        let rows: Vec<(i64, i64, String, String)> = sqlx::query_as(
            "SELECT id, owner_id, meta_key, meta_value FROM content_meta
             WHERE instr(meta_value, ?) > 0 ORDER BY id"
        )
        .bind(needle)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(rows
            .into_iter()
            .filter(|(_, _, key, _)| !excluded_keys.contains(&key.as_str()))
            .map(|(id, owner_id, key, value)| MetaRecord { id, owner_id, key, value })
            .collect())
    }

    async fn find_meta_by_key(&self, key: &str) -> DomainResult<Vec<MetaRecord>> {
        let rows: Vec<(i64, i64, String, String)> = sqlx::query_as(
            "SELECT id, owner_id, meta_key, meta_value FROM content_meta
             WHERE meta_key = ? ORDER BY id"
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(rows
            .into_iter()
            .map(|(id, owner_id, key, value)| MetaRecord { id, owner_id, key, value })
            .collect())
    }

    async fn apply_updates(&self, bodies: &[(i64, String)], metas: &[(i64, String)]) -> DomainResult<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let now = chrono::Utc::now().to_rfc3339();

        for (id, body) in bodies {
            sqlx::query("UPDATE content_items SET body = ?, updated_at = ? WHERE id = ?")
                .bind(body)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(DbError::from)?;
        }
        for (meta_id, value) in metas {
            sqlx::query("UPDATE content_meta SET meta_value = ? WHERE id = ?")
                .bind(value)
                .bind(meta_id)
                .execute(&mut *tx)
                .await
                .map_err(DbError::from)?;
        }

        tx.commit().await.map_err(DbError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_migration::test_pool;
    use serde_json::json;

    const OLD: &str = "http://site.test/uploads/2024/05/a.png";
    const NEW: &str = "https://zone.b-cdn.net/2024/05/a.png";

    #[test]
    fn test_tree_walk_replaces_nested_leaves_only() {
        let mut value = json!({
            "title": "hero",
            "width": 300,
            "images": [{"src": OLD}, {"src": "http://other/b.png"}],
            "nested": {"html": format!("<img src=\"{}\">", OLD), "flag": true}
        });
        let changed = replace_in_value(&mut value, &[UrlReplacement::new(OLD, NEW)]);
        assert!(changed);
        assert_eq!(value["images"][0]["src"], NEW);
        assert_eq!(value["images"][1]["src"], "http://other/b.png");
        assert_eq!(value["nested"]["html"], format!("<img src=\"{}\">", NEW));
        assert_eq!(value["width"], 300);
    }

    #[test]
    fn test_stored_value_handles_escaped_json() {
        let raw = r#"[{"settings":{"image":{"url":"http:\/\/site.test\/uploads\/2024\/05\/a.png"}}}]"#;
        let updated = rewrite_stored_value(raw, &[UrlReplacement::new(OLD, NEW)]).unwrap();
        let value: Value = serde_json::from_str(&updated).unwrap();
        assert_eq!(value[0]["settings"]["image"]["url"], NEW);

        assert_eq!(rewrite_stored_value("no urls here", &[UrlReplacement::new(OLD, NEW)]), None);
        assert_eq!(
            rewrite_stored_value(&format!("plain {}", OLD), &[UrlReplacement::new(OLD, NEW)]),
            Some(format!("plain {}", NEW))
        );
    }

    #[test]
    fn test_longer_source_wins() {
        let replacements = ordered(&[
            UrlReplacement::new("http://s/a.png", "https://c/a.png"),
            UrlReplacement::new("http://s/a.png.webp", "https://c/a.png.webp"),
        ]);
        assert_eq!(replacements[0].from, "http://s/a.png.webp");
        assert_eq!(
            replace_in_text("x http://s/a.png.webp y", &replacements).as_deref(),
            Some("x https://c/a.png.webp y")
        );
    }

    #[tokio::test]
    async fn test_rewriter_updates_bodies_meta_and_builder_data() {
        let pool = test_pool().await;
        sqlx::query("INSERT INTO content_items (id, body) VALUES (1, ?), (2, 'untouched')")
            .bind(format!("<p><img src=\"{}\"></p>", OLD))
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO content_meta (owner_id, meta_key, meta_value) VALUES
             (1, 'hero', ?), (1, '_wp_attachment_metadata', ?), (1, '_elementor_data', ?)"
        )
        .bind(format!("{{\"src\":\"{}\"}}", OLD))
        .bind(OLD)
        .bind(r#"[{"url":"http:\/\/site.test\/uploads\/2024\/05\/a.png"}]"#)
        .execute(&pool)
        .await
        .unwrap();

        let rewriter = ReferenceRewriter::new(Arc::new(SqliteContentRepository::new(pool.clone())));
        let summary = rewriter.rewrite(&[UrlReplacement::new(OLD, NEW)]).await.unwrap();
        assert_eq!(summary, RewriteSummary { content_updated: 1, meta_updated: 2 });

        let body: String = sqlx::query_scalar("SELECT body FROM content_items WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(body.contains(NEW));

        let excluded: String = sqlx::query_scalar(
            "SELECT meta_value FROM content_meta WHERE meta_key = '_wp_attachment_metadata'"
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(excluded, OLD);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_every_reference_untouched() {
        let pool = test_pool().await;
        sqlx::query("INSERT INTO content_items (id, body) VALUES (1, ?)")
            .bind(format!("<img src=\"{}\">", OLD))
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO content_meta (owner_id, meta_key, meta_value) VALUES (1, 'hero', ?)")
            .bind(OLD)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_meta_update BEFORE UPDATE ON content_meta
             BEGIN SELECT RAISE(ABORT, 'meta is read-only'); END"
        )
        .execute(&pool)
        .await
        .unwrap();

        let rewriter = ReferenceRewriter::new(Arc::new(SqliteContentRepository::new(pool.clone())));
        assert!(rewriter.rewrite(&[UrlReplacement::new(OLD, NEW)]).await.is_err());

        let body: String = sqlx::query_scalar("SELECT body FROM content_items WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(body.contains(OLD));
        assert!(!body.contains(NEW));
    }
}
