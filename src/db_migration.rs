use sqlx::SqlitePool;

use crate::errors::{DbError, DbResult};

// Embed all migration SQL files at compile time
const MIGRATION_ASSETS: &str = include_str!("../migrations/20250301000000_create_assets.sql");
const MIGRATION_CONTENT: &str = include_str!("../migrations/20250301000100_create_content.sql");
const MIGRATION_WORK_QUEUE: &str = include_str!("../migrations/20250301000200_create_work_queue.sql");

// Applied in order; names are recorded in the migrations table
const MIGRATIONS: &[(&str, &str)] = &[
    ("20250301000000_create_assets.sql", MIGRATION_ASSETS),
    ("20250301000100_create_content.sql", MIGRATION_CONTENT),
    ("20250301000200_create_work_queue.sql", MIGRATION_WORK_QUEUE),
];

/// Brings the schema up to date. Safe to call on every start.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    log::info!("Starting database migration process");
    create_migrations_table(pool).await?;

    let last_migration = get_last_migration(pool).await?;
    match &last_migration {
        Some(name) => log::debug!("Last applied migration: {}", name),
        None => log::debug!("No migrations applied yet"),
    }

    apply_pending_migrations(pool, last_migration).await
}

async fn create_migrations_table(pool: &SqlitePool) -> DbResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| DbError::Migration(format!("Failed to create migrations table: {}", e)))?;
    Ok(())
}

async fn get_last_migration(pool: &SqlitePool) -> DbResult<Option<String>> {
    sqlx::query_scalar::<_, String>("SELECT name FROM migrations ORDER BY id DESC LIMIT 1")
        .fetch_optional(pool)
        .await
        .map_err(|e| DbError::Migration(format!("Failed to get last migration: {}", e)))
}

async fn apply_pending_migrations(pool: &SqlitePool, last_migration: Option<String>) -> DbResult<()> {
    let pending = pending_migrations(last_migration.as_deref());
    if pending.is_empty() {
        log::info!("No pending migrations to apply");
        return Ok(());
    }
    log::info!("Applying {} pending migration(s)", pending.len());

    let mut tx = pool.begin().await.map_err(DbError::from)?;
    for (name, sql) in pending {
        sqlx::raw_sql(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::Migration(format!("Failed to apply migration {}: {}", name, e)))?;

        sqlx::query("INSERT INTO migrations (name, applied_at) VALUES (?, ?)")
            .bind(name)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::Migration(format!("Failed to record migration {}: {}", name, e)))?;
        log::debug!("Migration {} applied", name);
    }
    tx.commit().await.map_err(DbError::from)?;

    log::info!("All migrations applied");
    Ok(())
}

/// Migrations after `last_migration`, or all of them on a fresh database.
fn pending_migrations(last_migration: Option<&str>) -> Vec<(&'static str, &'static str)> {
    match last_migration {
        None => MIGRATIONS.to_vec(),
        Some(last) => MIGRATIONS
            .iter()
            .skip_while(|(name, _)| *name != last)
            .skip(1)
            .copied()
            .collect(),
    }
}

/// Migrated single-connection in-memory pool. One connection keeps every
/// query on the same in-memory database.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_after_last_applied() {
        assert_eq!(pending_migrations(None).len(), MIGRATIONS.len());
        let pending = pending_migrations(Some("20250301000000_create_assets.sql"));
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].0, "20250301000100_create_content.sql");
        assert!(pending_migrations(Some("20250301000200_create_work_queue.sql")).is_empty());
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = test_pool().await;
        run_migrations(&pool).await.unwrap();
        let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(applied, MIGRATIONS.len() as i64);
    }
}
