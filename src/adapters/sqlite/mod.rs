//! SQLite storage adapter: connection pooling, parameter normalization,
//! the vector column codec, and embedded migrations.

pub mod connection;
pub mod migrations;
pub mod params;
pub mod vector;

pub use connection::{
    create_pool, create_test_pool, normalize_database_url, verify_connection, ConnectionError,
    PoolConfig,
};
pub use migrations::{all_embedded_migrations, Migration, MigrationError, Migrator};
pub use params::{bind_values, normalize};
pub use vector::{cosine_distance, pack_vector, unpack_vector, VECTOR_BLOB_LEN};

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::domain::errors::{CoreError, CoreResult};

/// Serialize a datetime for a SQLite row. Fixed-width UTC milliseconds so
/// that lexicographic comparison (`MAX`, `<`) matches chronological order.
pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Parse an RFC3339 datetime string from a SQLite row field.
pub fn parse_datetime(s: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map_err(|e| CoreError::Internal(format!("bad datetime '{s}': {e}")))
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse an optional RFC3339 datetime string from a SQLite row field.
pub fn parse_optional_datetime(s: Option<String>) -> CoreResult<Option<DateTime<Utc>>> {
    s.map(|s| parse_datetime(&s)).transpose()
}

/// Parse a JSON string from a SQLite row field, falling back to the type's
/// default when absent.
pub fn parse_json_or_default<T: serde::de::DeserializeOwned + Default>(s: Option<String>) -> CoreResult<T> {
    s.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| CoreError::Internal(format!("bad json column: {e}")))
        .map(Option::unwrap_or_default)
}

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
    #[error("Query error: {0}")]
    Query(#[from] sqlx::Error),
}

/// Open (or create) a store at `database_url` and bring the schema current.
pub async fn initialize_database(database_url: &str) -> Result<SqlitePool, DatabaseError> {
    let pool = create_pool(database_url, None).await?;
    let migrator = Migrator::new(pool.clone());
    migrator.run_embedded_migrations(all_embedded_migrations()).await?;
    Ok(pool)
}

/// Create an in-memory test pool with all migrations applied.
pub async fn create_migrated_test_pool() -> Result<SqlitePool, DatabaseError> {
    let pool = create_test_pool().await?;
    let migrator = Migrator::new(pool.clone());
    migrator.run_embedded_migrations(all_embedded_migrations()).await?;
    Ok(pool)
}
