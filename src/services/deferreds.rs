//! Durable deferreds: single-shot resolution tokens backed by the store.

use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use std::time::Duration as StdDuration;

use crate::adapters::sqlite::{format_datetime, parse_datetime};
use crate::domain::errors::{CoreError, CoreResult};

/// Terminal state of a resolved deferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredOutcome {
    Value(serde_json::Value),
    Error(String),
}

const POLL_INITIAL: StdDuration = StdDuration::from_millis(50);
const POLL_MAX: StdDuration = StdDuration::from_millis(500);

#[derive(Clone)]
pub struct DeferredService {
    pool: SqlitePool,
}

impl DeferredService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a resolution token. Creating an existing url is a no-op.
    pub async fn create(&self, url: &str, ttl: Duration) -> CoreResult<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT OR IGNORE INTO deferreds (url, resolved, expires_at, created_at) \
             VALUES (?, 0, ?, ?)",
        )
        .bind(url)
        .bind(format_datetime(now + ttl))
        .bind(format_datetime(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flip `resolved` from 0 to 1 exactly once; a second resolution fails
    /// with `AlreadyResolved`.
    pub async fn resolve(&self, url: &str, outcome: DeferredOutcome) -> CoreResult<()> {
        let (value, error) = match &outcome {
            DeferredOutcome::Value(v) => (Some(serde_json::to_string(v)?), None),
            DeferredOutcome::Error(e) => (None, Some(e.clone())),
        };

        let result = sqlx::query(
            "UPDATE deferreds SET resolved = 1, value = ?, error = ? WHERE url = ? AND resolved = 0",
        )
        .bind(&value)
        .bind(&error)
        .bind(url)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<(i64,)> =
                sqlx::query_as("SELECT resolved FROM deferreds WHERE url = ?")
                    .bind(url)
                    .fetch_optional(&self.pool)
                    .await?;
            return match exists {
                Some(_) => Err(CoreError::AlreadyResolved(url.to_string())),
                None => Err(CoreError::not_found("deferred", url)),
            };
        }
        Ok(())
    }

    /// Current outcome without waiting.
    pub async fn peek(&self, url: &str) -> CoreResult<Option<DeferredOutcome>> {
        let row: Option<(i64, Option<String>, Option<String>, String)> = sqlx::query_as(
            "SELECT resolved, value, error, expires_at FROM deferreds WHERE url = ?",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        let Some((resolved, value, error, _)) = row else {
            return Err(CoreError::not_found("deferred", url));
        };
        if resolved == 0 {
            return Ok(None);
        }
        Ok(Some(match error {
            Some(e) => DeferredOutcome::Error(e),
            None => DeferredOutcome::Value(
                value.map(|v| serde_json::from_str(&v)).transpose()?.unwrap_or(serde_json::Value::Null),
            ),
        }))
    }

    /// Poll with bounded backoff until resolved, the deferred's own TTL
    /// elapses, or `timeout` runs out.
    pub async fn wait(&self, url: &str, timeout: StdDuration) -> CoreResult<DeferredOutcome> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff = POLL_INITIAL;

        loop {
            let row: Option<(i64, Option<String>, Option<String>, String)> = sqlx::query_as(
                "SELECT resolved, value, error, expires_at FROM deferreds WHERE url = ?",
            )
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;

            let Some((resolved, value, error, expires_at)) = row else {
                return Err(CoreError::not_found("deferred", url));
            };

            if resolved != 0 {
                return Ok(match error {
                    Some(e) => DeferredOutcome::Error(e),
                    None => DeferredOutcome::Value(
                        value
                            .map(|v| serde_json::from_str(&v))
                            .transpose()?
                            .unwrap_or(serde_json::Value::Null),
                    ),
                });
            }

            if parse_datetime(&expires_at)? <= Utc::now() {
                return Err(CoreError::Expired(format!("deferred ttl elapsed: {url}")));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::Expired(format!("wait timed out: {url}")));
            }

            tokio::time::sleep(backoff.min(deadline - tokio::time::Instant::now())).await;
            backoff = (backoff * 2).min(POLL_MAX);
        }
    }
}
