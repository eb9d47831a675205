//! Shared test fixtures.

use hivemind::adapters::sqlite::create_migrated_test_pool;
use hivemind::services::EventService;
use sqlx::SqlitePool;

/// In-memory store with the full schema applied.
#[allow(dead_code)]
pub async fn setup_test_pool() -> SqlitePool {
    create_migrated_test_pool()
        .await
        .expect("failed to create test pool")
}

#[allow(dead_code)]
pub async fn setup_event_service() -> EventService {
    EventService::new(setup_test_pool().await)
}
