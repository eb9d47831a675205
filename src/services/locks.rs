//! Distributed mutex with fencing tokens.

use chrono::{Duration, Utc};
use sqlx::SqlitePool;

use crate::adapters::sqlite::{format_datetime, parse_datetime};
use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::event::{types, LockAcquired, LockReleased, NewEvent};
use crate::domain::models::Lock;
use crate::services::event_store::EventService;

#[derive(Clone)]
pub struct LockService {
    events: EventService,
}

impl LockService {
    pub fn new(events: EventService) -> Self {
        Self { events }
    }

    fn pool(&self) -> &SqlitePool {
        self.events.pool()
    }

    /// Try to take `resource` for `holder`. Returns the fencing token on
    /// success, `None` when the lock is held. An expired row is stolen and
    /// the token still advances, so a past holder's writes stay rejectable.
    pub async fn try_acquire(
        &self,
        project_key: &str,
        resource: &str,
        holder: &str,
        ttl: Duration,
    ) -> CoreResult<Option<i64>> {
        if ttl <= Duration::zero() {
            return Err(CoreError::Invalid("lock ttl must be positive".to_string()));
        }

        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let current: Option<(String, String)> =
            sqlx::query_as("SELECT holder, expires_at FROM locks WHERE resource = ?")
                .bind(resource)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some((_, expires_at)) = &current {
            if parse_datetime(expires_at)? > now {
                return Ok(None);
            }
            sqlx::query("DELETE FROM locks WHERE resource = ? AND expires_at <= ?")
                .bind(resource)
                .bind(format_datetime(now))
                .execute(&mut *tx)
                .await?;
        }

        let last_seq: Option<(i64,)> =
            sqlx::query_as("SELECT last_seq FROM lock_tokens WHERE resource = ?")
                .bind(resource)
                .fetch_optional(&mut *tx)
                .await?;
        let seq = last_seq.map_or(0, |(s,)| s) + 1;

        let payload = LockAcquired {
            resource: resource.to_string(),
            holder: holder.to_string(),
            seq,
            expires_at: now + ttl,
        };
        let record = self
            .events
            .append_tx(
                &mut tx,
                NewEvent::new(types::LOCK_ACQUIRED, project_key, serde_json::to_value(&payload)?),
            )
            .await?;
        tx.commit().await?;
        self.events.publish(&record);

        Ok(Some(seq))
    }

    /// Release `resource` if `holder` still owns it; a mismatched holder is
    /// a no-op at the projection.
    pub async fn release(&self, project_key: &str, resource: &str, holder: &str) -> CoreResult<()> {
        let payload = LockReleased {
            resource: resource.to_string(),
            holder: holder.to_string(),
        };
        self.events
            .append(NewEvent::new(
                types::LOCK_RELEASED,
                project_key,
                serde_json::to_value(&payload)?,
            ))
            .await?;
        Ok(())
    }

    pub async fn get(&self, resource: &str) -> CoreResult<Option<Lock>> {
        let row: Option<(String, String, i64, String, String)> = sqlx::query_as(
            "SELECT resource, holder, seq, acquired_at, expires_at FROM locks WHERE resource = ?",
        )
        .bind(resource)
        .fetch_optional(self.pool())
        .await?;

        row.map(|(resource, holder, seq, acquired_at, expires_at)| {
            Ok(Lock {
                resource,
                holder,
                seq,
                acquired_at: parse_datetime(&acquired_at)?,
                expires_at: parse_datetime(&expires_at)?,
            })
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    async fn service() -> LockService {
        let pool = create_migrated_test_pool().await.unwrap();
        LockService::new(EventService::new(pool))
    }

    #[tokio::test]
    async fn second_acquire_fails_while_held() {
        let locks = service().await;
        let seq = locks.try_acquire("/p", "epic-1", "a", Duration::seconds(30)).await.unwrap();
        assert_eq!(seq, Some(1));

        let other = locks.try_acquire("/p", "epic-1", "b", Duration::seconds(30)).await.unwrap();
        assert_eq!(other, None);
    }

    #[tokio::test]
    async fn release_then_acquire_advances_the_token() {
        let locks = service().await;
        assert_eq!(
            locks.try_acquire("/p", "r", "a", Duration::seconds(30)).await.unwrap(),
            Some(1)
        );
        locks.release("/p", "r", "a").await.unwrap();
        assert_eq!(
            locks.try_acquire("/p", "r", "b", Duration::seconds(30)).await.unwrap(),
            Some(2)
        );
    }

    #[tokio::test]
    async fn mismatched_holder_cannot_release() {
        let locks = service().await;
        locks.try_acquire("/p", "r", "a", Duration::seconds(30)).await.unwrap();
        locks.release("/p", "r", "intruder").await.unwrap();
        assert!(locks.get("r").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_lock_is_stolen_with_a_higher_token() {
        let locks = service().await;
        assert_eq!(
            locks.try_acquire("/p", "r", "a", Duration::milliseconds(1)).await.unwrap(),
            Some(1)
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let stolen = locks.try_acquire("/p", "r", "b", Duration::seconds(30)).await.unwrap();
        assert_eq!(stolen, Some(2));
        assert_eq!(locks.get("r").await.unwrap().unwrap().holder, "b");
    }

    #[tokio::test]
    async fn fencing_tokens_never_repeat() {
        let locks = service().await;
        let mut seen = Vec::new();
        for holder in ["a", "b", "c"] {
            let seq = locks
                .try_acquire("/p", "r", holder, Duration::milliseconds(1))
                .await
                .unwrap()
                .unwrap();
            seen.push(seq);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
