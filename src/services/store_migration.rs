//! Auto-migration of older project-local stores into the global store.
//!
//! Tables are copied with `INSERT OR IGNORE`, so re-running is idempotent;
//! source-only columns are skipped. On success the source file is renamed
//! with a timestamped `.backup-` suffix so nothing merges twice.

use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::domain::errors::{CoreError, CoreResult};

/// Project-local store locations older layouts used.
pub const LEGACY_STORE_CANDIDATES: &[&str] = &[".hivemind/legacy.db", ".swarm-tools/swarm.db"];

#[derive(Debug, Clone, Default)]
pub struct StoreMigrationReport {
    /// Per-table rows copied (or, in a dry run, rows offered).
    pub tables: Vec<(String, u64)>,
    pub backed_up_to: Option<PathBuf>,
    pub dry_run: bool,
}

impl StoreMigrationReport {
    pub fn total_rows(&self) -> u64 {
        self.tables.iter().map(|(_, n)| n).sum()
    }
}

/// Look for a legacy store beside the project root and merge the first hit.
pub async fn auto_migrate(pool: &SqlitePool, project_root: &Path, dry_run: bool) -> CoreResult<Option<StoreMigrationReport>> {
    for candidate in LEGACY_STORE_CANDIDATES {
        let path = project_root.join(candidate);
        if path.is_file() {
            tracing::info!(path = %path.display(), "legacy store detected, merging");
            return Ok(Some(merge_store(pool, &path, dry_run).await?));
        }
    }
    Ok(None)
}

/// Merge `source` into the store behind `pool`.
pub async fn merge_store(pool: &SqlitePool, source: &Path, dry_run: bool) -> CoreResult<StoreMigrationReport> {
    if !source.is_file() {
        return Err(CoreError::not_found("legacy store", source.display().to_string()));
    }

    let source_str = source
        .to_str()
        .ok_or_else(|| CoreError::Invalid(format!("non-utf8 store path: {}", source.display())))?;

    sqlx::query("ATTACH DATABASE ? AS legacy")
        .bind(source_str)
        .execute(pool)
        .await?;

    let result = copy_tables(pool, dry_run).await;

    // Always detach, even when the copy failed.
    let _ = sqlx::query("DETACH DATABASE legacy").execute(pool).await;

    let mut report = result?;
    report.dry_run = dry_run;

    if !dry_run {
        let backup = backup_path(source);
        std::fs::rename(source, &backup)
            .map_err(|e| CoreError::Internal(format!("backup rename failed: {e}")))?;
        report.backed_up_to = Some(backup);
    }
    Ok(report)
}

async fn copy_tables(pool: &SqlitePool, dry_run: bool) -> CoreResult<StoreMigrationReport> {
    let source_tables = user_tables(pool, "legacy").await?;
    let target_tables: HashSet<String> = user_tables(pool, "main").await?.into_iter().collect();

    let mut report = StoreMigrationReport::default();
    for table in source_tables {
        if !target_tables.contains(&table) {
            tracing::debug!(%table, "skipping table absent from target schema");
            continue;
        }

        let source_columns = table_columns(pool, "legacy", &table).await?;
        let target_columns: HashSet<String> =
            table_columns(pool, "main", &table).await?.into_iter().collect();
        let shared: Vec<String> = source_columns
            .into_iter()
            .filter(|c| target_columns.contains(c))
            .collect();
        if shared.is_empty() {
            continue;
        }

        let column_list = shared
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");

        let copied = if dry_run {
            let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM legacy.\"{table}\""))
                .fetch_one(pool)
                .await?;
            row.0 as u64
        } else {
            let result = sqlx::query(&format!(
                "INSERT OR IGNORE INTO main.\"{table}\" ({column_list}) \
                 SELECT {column_list} FROM legacy.\"{table}\""
            ))
            .execute(pool)
            .await?;
            result.rows_affected()
        };
        report.tables.push((table, copied));
    }
    Ok(report)
}

async fn user_tables(pool: &SqlitePool, schema: &str) -> CoreResult<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(&format!(
        "SELECT name FROM {schema}.sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
           AND name NOT LIKE '%_fts%' AND name != 'schema_migrations' \
         ORDER BY name"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

async fn table_columns(pool: &SqlitePool, schema: &str, table: &str) -> CoreResult<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(&format!(
        "SELECT name FROM {schema}.pragma_table_info('{table}')"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

fn backup_path(source: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    PathBuf::from(format!("{}.backup-{stamp}", source.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_pool, initialize_database};

    async fn seed_legacy(path: &Path) {
        let pool = create_pool(path.to_str().unwrap(), None).await.unwrap();
        sqlx::query(
            "CREATE TABLE cursors (stream TEXT NOT NULL, checkpoint TEXT NOT NULL, \
             position INTEGER NOT NULL DEFAULT 0, updated_at TEXT NOT NULL, \
             extra_legacy_only TEXT, PRIMARY KEY (stream, checkpoint))",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO cursors (stream, checkpoint, position, updated_at, extra_legacy_only) \
             VALUES ('events', 'worker', 42, '2026-01-01T00:00:00.000Z', 'dropme')",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool.close().await;
    }

    #[tokio::test]
    async fn merges_shared_columns_and_backs_up_source() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("legacy.db");
        seed_legacy(&legacy).await;

        let target = dir.path().join("global.db");
        let pool = initialize_database(target.to_str().unwrap()).await.unwrap();

        let report = merge_store(&pool, &legacy, false).await.unwrap();
        assert_eq!(report.tables, vec![("cursors".to_string(), 1)]);
        assert!(!legacy.exists());
        assert!(report.backed_up_to.as_ref().unwrap().exists());

        let row: (i64,) =
            sqlx::query_as("SELECT position FROM cursors WHERE stream = 'events' AND checkpoint = 'worker'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(row.0, 42);
    }

    #[tokio::test]
    async fn dry_run_counts_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("legacy.db");
        seed_legacy(&legacy).await;

        let target = dir.path().join("global.db");
        let pool = initialize_database(target.to_str().unwrap()).await.unwrap();

        let report = merge_store(&pool, &legacy, true).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.total_rows(), 1);
        assert!(legacy.exists());

        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cursors")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }

    #[tokio::test]
    async fn rerunning_the_merge_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("legacy.db");
        seed_legacy(&legacy).await;

        let target = dir.path().join("global.db");
        let pool = initialize_database(target.to_str().unwrap()).await.unwrap();

        merge_store(&pool, &legacy, true).await.unwrap();
        let second = merge_store(&pool, &legacy, true).await.unwrap();
        assert_eq!(second.total_rows(), 1);
    }
}
