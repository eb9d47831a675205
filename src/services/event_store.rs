//! Append-only event log with synchronous projections.
//!
//! `append` inserts a row, runs every projection handler inside the same
//! transaction, commits, and only then publishes the record to live
//! subscribers. Readers therefore never observe an event whose projection
//! has not been applied.

use serde_json::{json, Value};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::broadcast;

use crate::adapters::sqlite::{bind_values, normalize, parse_datetime};
use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::event::{EventFilter, EventRecord, NewEvent};
use crate::services::projection;

const LIVE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventService {
    pool: SqlitePool,
    live: broadcast::Sender<EventRecord>,
}

impl EventService {
    pub fn new(pool: SqlitePool) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self { pool, live }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Subscribe to committed events. Frames arrive in commit order.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.live.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.live.receiver_count()
    }

    /// Append one event and apply its projections atomically.
    pub async fn append(&self, event: NewEvent) -> CoreResult<EventRecord> {
        let mut tx = self.pool.begin().await?;
        let record = self.append_tx(&mut tx, event).await?;
        tx.commit().await?;
        self.publish(&record);
        Ok(record)
    }

    /// Append within a caller-owned transaction (compound updates such as
    /// reservation conflict-check + insert). The caller commits and then
    /// publishes the returned record.
    pub async fn append_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        event: NewEvent,
    ) -> CoreResult<EventRecord> {
        let data = serde_json::to_string(&event.data)?;
        let result = sqlx::query(
            "INSERT INTO events (event_type, project_key, timestamp, data) VALUES (?, ?, ?, ?)",
        )
        .bind(&event.event_type)
        .bind(&event.project_key)
        .bind(event.timestamp)
        .bind(&data)
        .execute(&mut **tx)
        .await?;

        // sequence is the rowid, so it is visible immediately after insert.
        let id = result.last_insert_rowid();
        let record = EventRecord {
            id,
            sequence: id,
            event_type: event.event_type,
            project_key: event.project_key,
            timestamp: event.timestamp,
            data: event.data,
            created_at: chrono::Utc::now(),
        };

        projection::apply(&mut **tx, &record).await?;
        Ok(record)
    }

    /// Publish a committed record to live subscribers. Lossy when nobody
    /// listens; SSE replay covers late joiners.
    pub fn publish(&self, record: &EventRecord) {
        let _ = self.live.send(record.clone());
    }

    /// Read events matching `filter`, ordered by sequence ascending.
    pub async fn read_events(&self, filter: &EventFilter) -> CoreResult<Vec<EventRecord>> {
        let mut sql = String::from(
            "SELECT id, event_type, project_key, timestamp, data, created_at FROM events WHERE 1=1",
        );
        let mut params: Vec<Value> = Vec::new();

        if let Some(project) = &filter.project_key {
            params.push(json!(project));
            sql.push_str(&format!(" AND project_key = ${}", params.len()));
        }
        if !filter.types.is_empty() {
            params.push(json!(filter.types));
            sql.push_str(&format!(" AND event_type = ANY(${})", params.len()));
        }
        if let Some(since) = filter.since_ms {
            params.push(json!(since));
            sql.push_str(&format!(" AND timestamp >= ${}", params.len()));
        }
        if let Some(until) = filter.until_ms {
            params.push(json!(until));
            sql.push_str(&format!(" AND timestamp <= ${}", params.len()));
        }
        if let Some(after) = filter.after_sequence {
            params.push(json!(after));
            sql.push_str(&format!(" AND id > ${}", params.len()));
        }
        if let Some(cell_id) = &filter.cell_id {
            params.push(json!(cell_id));
            let n = params.len();
            sql.push_str(&format!(
                " AND event_type LIKE 'cell_%' AND \
                 (json_extract(data, '$.cell_id') = ${n} OR json_extract(data, '$.id') = ${n})"
            ));
        }

        sql.push_str(" ORDER BY id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = filter.offset {
            if filter.limit.is_none() {
                sql.push_str(" LIMIT -1");
            }
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        let (sql, binds) = normalize(&sql, &params)?;
        let rows = bind_values(sqlx::query(&sql), &binds)?
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_record).collect()
    }

    /// Current stream head for a project; 0 when the project has no events.
    pub async fn latest_sequence(&self, project_key: &str) -> CoreResult<i64> {
        let row: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(id) FROM events WHERE project_key = ?")
                .bind(project_key)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0.unwrap_or(0))
    }

    /// Recovery path: optionally truncate the project's materialized views,
    /// then re-apply projections in sequence order. Incremental application
    /// and replay end in the same projection state.
    pub async fn replay(&self, project_key: &str, clear_views: bool) -> CoreResult<u64> {
        let mut tx = self.pool.begin().await?;

        if clear_views {
            clear_project_views(&mut tx, project_key).await?;
        }

        let rows = sqlx::query(
            "SELECT id, event_type, project_key, timestamp, data, created_at \
             FROM events WHERE project_key = ? ORDER BY id ASC",
        )
        .bind(project_key)
        .fetch_all(&mut *tx)
        .await?;

        let mut applied = 0u64;
        for row in &rows {
            let record = row_to_record(row)?;
            projection::apply(&mut *tx, &record).await?;
            applied += 1;
        }

        tx.commit().await?;
        Ok(applied)
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> CoreResult<EventRecord> {
    let id: i64 = row.try_get("id").map_err(CoreError::from)?;
    let data: String = row.try_get("data").map_err(CoreError::from)?;
    let created_at: String = row.try_get("created_at").map_err(CoreError::from)?;
    Ok(EventRecord {
        id,
        sequence: id,
        event_type: row.try_get("event_type").map_err(CoreError::from)?,
        project_key: row.try_get("project_key").map_err(CoreError::from)?,
        timestamp: row.try_get("timestamp").map_err(CoreError::from)?,
        data: serde_json::from_str(&data)?,
        created_at: parse_datetime(&created_at).unwrap_or_else(|_| chrono::Utc::now()),
    })
}

/// Delete the project-scoped projections. Locks are shared across projects
/// and reconciled by their idempotent handlers instead.
async fn clear_project_views(
    tx: &mut Transaction<'_, Sqlite>,
    project_key: &str,
) -> CoreResult<()> {
    for sql in [
        "DELETE FROM cell_dependencies WHERE cell_id IN (SELECT id FROM cells WHERE project_key = ?)",
        "DELETE FROM cell_labels WHERE cell_id IN (SELECT id FROM cells WHERE project_key = ?)",
        "DELETE FROM cell_comments WHERE cell_id IN (SELECT id FROM cells WHERE project_key = ?)",
        "DELETE FROM blocked_cells WHERE cell_id IN (SELECT id FROM cells WHERE project_key = ?)",
        "DELETE FROM dirty_cells WHERE cell_id IN (SELECT id FROM cells WHERE project_key = ?)",
        "DELETE FROM cells WHERE project_key = ?",
        "DELETE FROM message_recipients WHERE message_id IN (SELECT id FROM messages WHERE project_key = ?)",
        "DELETE FROM messages WHERE project_key = ?",
        "DELETE FROM reservations WHERE project_key = ?",
        "DELETE FROM agents WHERE project_key = ?",
    ] {
        sqlx::query(sql).bind(project_key).execute(&mut **tx).await?;
    }
    Ok(())
}
