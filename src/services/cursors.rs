//! Durable cursors for at-least-once consumers.

use chrono::Utc;
use sqlx::SqlitePool;

use crate::adapters::sqlite::format_datetime;
use crate::domain::errors::CoreResult;

#[derive(Clone)]
pub struct CursorService {
    pool: SqlitePool,
}

impl CursorService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Advance `(stream, checkpoint)` to `position`, only ever forward.
    /// Returns true when the stored position moved.
    pub async fn advance(&self, stream: &str, checkpoint: &str, position: i64) -> CoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO cursors (stream, checkpoint, position, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(stream, checkpoint) DO UPDATE SET \
                 position = excluded.position, updated_at = excluded.updated_at \
             WHERE excluded.position > cursors.position",
        )
        .bind(stream)
        .bind(checkpoint)
        .bind(position)
        .bind(format_datetime(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Resume position; 0 when the cursor has never been advanced.
    pub async fn read(&self, stream: &str, checkpoint: &str) -> CoreResult<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT position FROM cursors WHERE stream = ? AND checkpoint = ?")
                .bind(stream)
                .bind(checkpoint)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map_or(0, |(p,)| p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    async fn service() -> CursorService {
        CursorService::new(create_migrated_test_pool().await.unwrap())
    }

    #[tokio::test]
    async fn absent_cursor_reads_zero() {
        let cursors = service().await;
        assert_eq!(cursors.read("events", "worker").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn advance_is_monotonic() {
        let cursors = service().await;
        assert!(cursors.advance("events", "worker", 10).await.unwrap());
        assert!(cursors.advance("events", "worker", 25).await.unwrap());
        // Going backwards or standing still is refused.
        assert!(!cursors.advance("events", "worker", 25).await.unwrap());
        assert!(!cursors.advance("events", "worker", 5).await.unwrap());
        assert_eq!(cursors.read("events", "worker").await.unwrap(), 25);
    }

    #[tokio::test]
    async fn checkpoints_are_independent() {
        let cursors = service().await;
        cursors.advance("events", "a", 7).await.unwrap();
        cursors.advance("events", "b", 3).await.unwrap();
        assert_eq!(cursors.read("events", "a").await.unwrap(), 7);
        assert_eq!(cursors.read("events", "b").await.unwrap(), 3);
    }
}
