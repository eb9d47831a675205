//! Projection engine: materializes views from committed events.
//!
//! `apply` dispatches on the event type and issues idempotent upserts.
//! Handlers are commutative under redelivery of the same event but not
//! under reordering; callers enforce sequence order. Unknown event types
//! are a deliberate no-op so old stores replay under newer binaries.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use std::collections::{HashSet, VecDeque};

use crate::adapters::sqlite::format_datetime;
use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::event::{self, types, EventRecord};

pub async fn apply(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    match record.event_type.as_str() {
        types::AGENT_REGISTERED => agent_registered(conn, record).await?,
        types::AGENT_ACTIVE => agent_active(conn, record).await?,
        types::MESSAGE_SENT => message_sent(conn, record).await?,
        types::MESSAGE_READ => message_receipt(conn, record, "read_at").await?,
        types::MESSAGE_ACKED => message_receipt(conn, record, "acked_at").await?,
        types::RESERVATION_ACQUIRED => reservation_acquired(conn, record).await?,
        types::RESERVATION_RELEASED => reservation_released(conn, record).await?,
        types::RESERVATION_EXPIRED => reservation_expired(conn, record).await?,
        types::LOCK_ACQUIRED => lock_acquired(conn, record).await?,
        types::LOCK_RELEASED => lock_released(conn, record).await?,
        types::CELL_CREATED => cell_created(conn, record).await?,
        types::CELL_UPDATED => cell_updated(conn, record).await?,
        types::CELL_CLOSED => cell_closed(conn, record).await?,
        types::CELL_DELETED => cell_deleted(conn, record).await?,
        types::CELL_RESTORED => cell_restored(conn, record).await?,
        types::CELL_DEP_ADDED => cell_dep_added(conn, record).await?,
        types::CELL_DEP_REMOVED => cell_dep_removed(conn, record).await?,
        types::CELL_LABEL_ADDED => cell_label_added(conn, record).await?,
        types::CELL_LABEL_REMOVED => cell_label_removed(conn, record).await?,
        types::CELL_COMMENT_ADDED => cell_comment_added(conn, record).await?,
        // Audit-only events: no materialized effect.
        types::CELL_VALIDATED | types::MEMORY_STORED | types::MEMORY_REMOVED => {}
        _ => {}
    }

    touch_mentioned_agents(conn, record).await
}

fn payload<T: serde::de::DeserializeOwned>(record: &EventRecord) -> CoreResult<T> {
    serde_json::from_value(record.data.clone()).map_err(|e| {
        CoreError::Internal(format!(
            "malformed {} payload at sequence {}: {e}",
            record.event_type, record.sequence
        ))
    })
}

// -- agents --

async fn agent_registered(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    let data: event::AgentRegistered = payload(record)?;
    let at = format_datetime(record.occurred_at());
    sqlx::query(
        "INSERT INTO agents (project_key, name, program, model, task_description, registered_at, last_active_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(project_key, name) DO UPDATE SET \
             last_active_at = MAX(agents.last_active_at, excluded.last_active_at)",
    )
    .bind(&record.project_key)
    .bind(&data.name)
    .bind(&data.program)
    .bind(&data.model)
    .bind(&data.task_description)
    .bind(&at)
    .bind(&at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn agent_active(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    let data: event::AgentActive = payload(record)?;
    let at = format_datetime(record.occurred_at());
    sqlx::query(
        "INSERT INTO agents (project_key, name, registered_at, last_active_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(project_key, name) DO UPDATE SET \
             last_active_at = MAX(agents.last_active_at, excluded.last_active_at)",
    )
    .bind(&record.project_key)
    .bind(&data.name)
    .bind(&at)
    .bind(&at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Any event whose data mentions an agent advances that agent's
/// `last_active_at`, monotonically.
async fn touch_mentioned_agents(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    let mut names: HashSet<String> = HashSet::new();
    for key in ["name", "agent_name", "from_agent", "holder", "author", "assignee", "created_by"] {
        if let Some(value) = record.data.get(key).and_then(|v| v.as_str()) {
            names.insert(value.to_string());
        }
    }
    if let Some(recipients) = record.data.get("recipients").and_then(|v| v.as_array()) {
        for r in recipients {
            if let Some(s) = r.as_str() {
                names.insert(s.to_string());
            }
        }
    }
    if names.is_empty() {
        return Ok(());
    }

    let at = format_datetime(record.occurred_at());
    for name in names {
        sqlx::query(
            "UPDATE agents SET last_active_at = MAX(last_active_at, ?) \
             WHERE project_key = ? AND name = ?",
        )
        .bind(&at)
        .bind(&record.project_key)
        .bind(&name)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

// -- messages --

async fn message_sent(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    let data: event::MessageSent = payload(record)?;
    let at = format_datetime(record.occurred_at());
    sqlx::query(
        "INSERT OR IGNORE INTO messages \
         (id, project_key, from_agent, subject, body, thread_id, importance, ack_required, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&data.message_id)
    .bind(&record.project_key)
    .bind(&data.from_agent)
    .bind(&data.subject)
    .bind(&data.body)
    .bind(&data.thread_id)
    .bind(&data.importance)
    .bind(i64::from(data.ack_required))
    .bind(&at)
    .execute(&mut *conn)
    .await?;

    for recipient in &data.recipients {
        sqlx::query(
            "INSERT OR IGNORE INTO message_recipients (message_id, agent_name) VALUES (?, ?)",
        )
        .bind(&data.message_id)
        .bind(recipient)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn message_receipt(
    conn: &mut SqliteConnection,
    record: &EventRecord,
    column: &str,
) -> CoreResult<()> {
    let data: event::MessageReceipt = payload(record)?;
    let at = format_datetime(record.occurred_at());
    // COALESCE keeps the first timestamp: receipts advance, never clear.
    let sql = format!(
        "UPDATE message_recipients SET {column} = COALESCE({column}, ?) \
         WHERE message_id = ? AND agent_name = ?"
    );
    sqlx::query(&sql)
        .bind(&at)
        .bind(&data.message_id)
        .bind(&data.agent_name)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// -- reservations --

async fn reservation_acquired(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    let data: event::ReservationAcquired = payload(record)?;
    let created = format_datetime(record.occurred_at());
    let expires = format_datetime(data.expires_at);
    for entry in &data.patterns {
        sqlx::query(
            "INSERT OR IGNORE INTO reservations \
             (id, project_key, agent_name, path_pattern, exclusive, reason, created_at, expires_at, lock_holder_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.row_id)
        .bind(&record.project_key)
        .bind(&data.agent_name)
        .bind(&entry.pattern)
        .bind(i64::from(data.exclusive))
        .bind(&data.reason)
        .bind(&created)
        .bind(&expires)
        .bind(&data.handle_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn reservation_released(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    let data: event::ReservationReleased = payload(record)?;
    let at = format_datetime(record.occurred_at());
    sqlx::query(
        "UPDATE reservations SET released_at = ? \
         WHERE project_key = ? AND released_at IS NULL \
           AND (lock_holder_id = ? OR id = ?)",
    )
    .bind(&at)
    .bind(&record.project_key)
    .bind(&data.handle_id)
    .bind(&data.handle_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn reservation_expired(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    let data: event::ReservationExpired = payload(record)?;
    sqlx::query(
        "UPDATE reservations SET released_at = expires_at \
         WHERE id = ? AND released_at IS NULL",
    )
    .bind(&data.reservation_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// -- locks --

async fn lock_acquired(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    let data: event::LockAcquired = payload(record)?;
    let acquired = format_datetime(record.occurred_at());
    let expires = format_datetime(data.expires_at);

    // Replace only a newer acquisition or a steal of an expired row; a
    // redelivered event carries the same seq and becomes a no-op.
    sqlx::query(
        "INSERT INTO locks (resource, holder, seq, acquired_at, expires_at) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(resource) DO UPDATE SET \
             holder = excluded.holder, \
             seq = excluded.seq, \
             acquired_at = excluded.acquired_at, \
             expires_at = excluded.expires_at \
         WHERE excluded.seq > locks.seq",
    )
    .bind(&data.resource)
    .bind(&data.holder)
    .bind(data.seq)
    .bind(&acquired)
    .bind(&expires)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "INSERT INTO lock_tokens (resource, last_seq) VALUES (?, ?) \
         ON CONFLICT(resource) DO UPDATE SET last_seq = MAX(lock_tokens.last_seq, excluded.last_seq)",
    )
    .bind(&data.resource)
    .bind(data.seq)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn lock_released(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    let data: event::LockReleased = payload(record)?;
    sqlx::query("DELETE FROM locks WHERE resource = ? AND holder = ?")
        .bind(&data.resource)
        .bind(&data.holder)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// -- cells --

async fn cell_created(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    let data: event::CellCreated = payload(record)?;
    sqlx::query(
        "INSERT OR IGNORE INTO cells \
         (id, project_key, cell_type, status, title, description, priority, parent_id, assignee, \
          created_by, created_at, updated_at, closed_at, closed_reason) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&data.id)
    .bind(&record.project_key)
    .bind(&data.cell_type)
    .bind(&data.status)
    .bind(&data.title)
    .bind(&data.description)
    .bind(data.priority)
    .bind(&data.parent_id)
    .bind(&data.assignee)
    .bind(&data.created_by)
    .bind(format_datetime(data.created_at))
    .bind(format_datetime(data.updated_at))
    .bind(data.closed_at.map(format_datetime))
    .bind(&data.closed_reason)
    .execute(&mut *conn)
    .await?;

    refresh_affected(conn, &data.id, record.occurred_at()).await
}

async fn cell_updated(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    let data: event::CellUpdated = payload(record)?;
    let row: Option<(String, Option<String>)> =
        sqlx::query_as("SELECT status, closed_at FROM cells WHERE id = ?")
            .bind(&data.id)
            .fetch_optional(&mut *conn)
            .await?;
    let Some((current_status, current_closed_at)) = row else {
        return Ok(());
    };

    let updated_at = format_datetime(data.updated_at.unwrap_or_else(|| record.occurred_at()));
    let new_status = data.status.clone().unwrap_or(current_status);
    // Keep the invariant: closed status and closed_at move together.
    let closed_at = if new_status == "closed" {
        data.closed_at
            .map(format_datetime)
            .or(current_closed_at)
            .or_else(|| Some(updated_at.clone()))
    } else {
        None
    };

    sqlx::query(
        "UPDATE cells SET \
             title = COALESCE(?, title), \
             description = COALESCE(?, description), \
             status = ?, \
             priority = COALESCE(?, priority), \
             assignee = COALESCE(?, assignee), \
             parent_id = COALESCE(?, parent_id), \
             closed_at = ?, \
             updated_at = ? \
         WHERE id = ?",
    )
    .bind(&data.title)
    .bind(&data.description)
    .bind(&new_status)
    .bind(data.priority)
    .bind(&data.assignee)
    .bind(&data.parent_id)
    .bind(&closed_at)
    .bind(&updated_at)
    .bind(&data.id)
    .execute(&mut *conn)
    .await?;

    refresh_affected(conn, &data.id, record.occurred_at()).await
}

async fn cell_closed(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    let data: event::CellClosed = payload(record)?;
    let at = format_datetime(record.occurred_at());
    sqlx::query(
        "UPDATE cells SET status = 'closed', closed_at = COALESCE(closed_at, ?), \
             closed_reason = COALESCE(?, closed_reason), updated_at = ? \
         WHERE id = ?",
    )
    .bind(&at)
    .bind(&data.reason)
    .bind(&at)
    .bind(&data.id)
    .execute(&mut *conn)
    .await?;

    refresh_affected(conn, &data.id, record.occurred_at()).await
}

async fn cell_deleted(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    let data: event::CellDeleted = payload(record)?;
    let at = format_datetime(record.occurred_at());
    sqlx::query(
        "UPDATE cells SET deleted_at = COALESCE(deleted_at, ?), deleted_by = COALESCE(deleted_by, ?), \
             updated_at = ? \
         WHERE id = ?",
    )
    .bind(&at)
    .bind(&data.deleted_by)
    .bind(&at)
    .bind(&data.id)
    .execute(&mut *conn)
    .await?;

    refresh_affected(conn, &data.id, record.occurred_at()).await
}

async fn cell_restored(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    let data: event::CellRestored = payload(record)?;
    let at = format_datetime(record.occurred_at());
    sqlx::query(
        "UPDATE cells SET deleted_at = NULL, deleted_by = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(&at)
    .bind(&data.id)
    .execute(&mut *conn)
    .await?;

    refresh_affected(conn, &data.id, record.occurred_at()).await
}

async fn cell_dep_added(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    let data: event::CellDepChanged = payload(record)?;
    let at = format_datetime(record.occurred_at());
    sqlx::query(
        "INSERT OR IGNORE INTO cell_dependencies (cell_id, depends_on_id, relationship, created_at) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(&data.cell_id)
    .bind(&data.depends_on_id)
    .bind(&data.relationship)
    .bind(&at)
    .execute(&mut *conn)
    .await?;

    refresh_affected(conn, &data.cell_id, record.occurred_at()).await
}

async fn cell_dep_removed(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    let data: event::CellDepChanged = payload(record)?;
    sqlx::query(
        "DELETE FROM cell_dependencies WHERE cell_id = ? AND depends_on_id = ? AND relationship = ?",
    )
    .bind(&data.cell_id)
    .bind(&data.depends_on_id)
    .bind(&data.relationship)
    .execute(&mut *conn)
    .await?;

    refresh_affected(conn, &data.cell_id, record.occurred_at()).await
}

async fn cell_label_added(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    let data: event::CellLabelChanged = payload(record)?;
    sqlx::query("INSERT OR IGNORE INTO cell_labels (cell_id, label) VALUES (?, ?)")
        .bind(&data.cell_id)
        .bind(&data.label)
        .execute(&mut *conn)
        .await?;
    mark_dirty(conn, &data.cell_id, record.occurred_at()).await
}

async fn cell_label_removed(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    let data: event::CellLabelChanged = payload(record)?;
    sqlx::query("DELETE FROM cell_labels WHERE cell_id = ? AND label = ?")
        .bind(&data.cell_id)
        .bind(&data.label)
        .execute(&mut *conn)
        .await?;
    mark_dirty(conn, &data.cell_id, record.occurred_at()).await
}

async fn cell_comment_added(conn: &mut SqliteConnection, record: &EventRecord) -> CoreResult<()> {
    let data: event::CellCommentAdded = payload(record)?;
    let at = format_datetime(record.occurred_at());
    sqlx::query(
        "INSERT OR IGNORE INTO cell_comments (id, cell_id, author, body, parent_id, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&data.comment_id)
    .bind(&data.cell_id)
    .bind(&data.author)
    .bind(&data.body)
    .bind(&data.parent_id)
    .bind(&at)
    .execute(&mut *conn)
    .await?;
    mark_dirty(conn, &data.cell_id, record.occurred_at()).await
}

// -- blocked cache --

/// Recompute the blocked cache for a cell and, transitively along `blocks`
/// edges, for every cell that depends on it.
pub(crate) async fn refresh_affected(
    conn: &mut SqliteConnection,
    cell_id: &str,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    seen.insert(cell_id.to_string());
    queue.push_back(cell_id.to_string());

    while let Some(current) = queue.pop_front() {
        refresh_blocked_cache(conn, &current, now).await?;

        let dependents: Vec<(String,)> = sqlx::query_as(
            "SELECT cell_id FROM cell_dependencies WHERE depends_on_id = ? AND relationship = 'blocks'",
        )
        .bind(&current)
        .fetch_all(&mut *conn)
        .await?;

        for (dependent,) in dependents {
            if seen.insert(dependent.clone()) {
                queue.push_back(dependent);
            }
        }
    }
    Ok(())
}

/// A cell's blockers are its direct `blocks` predecessors that are open or
/// in progress and not deleted. An empty list removes the cache row.
async fn refresh_blocked_cache(
    conn: &mut SqliteConnection,
    cell_id: &str,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let blockers: Vec<(String,)> = sqlx::query_as(
        "SELECT d.depends_on_id FROM cell_dependencies d \
         JOIN cells c ON c.id = d.depends_on_id \
         WHERE d.cell_id = ? AND d.relationship = 'blocks' \
           AND c.status IN ('open', 'in_progress') AND c.deleted_at IS NULL \
         ORDER BY d.depends_on_id",
    )
    .bind(cell_id)
    .fetch_all(&mut *conn)
    .await?;

    if blockers.is_empty() {
        sqlx::query("DELETE FROM blocked_cells WHERE cell_id = ?")
            .bind(cell_id)
            .execute(&mut *conn)
            .await?;
    } else {
        let ids: Vec<&str> = blockers.iter().map(|(id,)| id.as_str()).collect();
        let json = serde_json::to_string(&ids)?;
        sqlx::query(
            "INSERT INTO blocked_cells (cell_id, blocker_ids, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(cell_id) DO UPDATE SET \
                 blocker_ids = excluded.blocker_ids, updated_at = excluded.updated_at",
        )
        .bind(cell_id)
        .bind(&json)
        .bind(format_datetime(now))
        .execute(&mut *conn)
        .await?;
    }

    mark_dirty(conn, cell_id, now).await
}

/// Queue the cell for incremental JSONL export.
async fn mark_dirty(conn: &mut SqliteConnection, cell_id: &str, now: DateTime<Utc>) -> CoreResult<()> {
    sqlx::query(
        "INSERT INTO dirty_cells (cell_id, marked_at) VALUES (?, ?) \
         ON CONFLICT(cell_id) DO UPDATE SET marked_at = excluded.marked_at",
    )
    .bind(cell_id)
    .bind(format_datetime(now))
    .execute(&mut *conn)
    .await?;
    Ok(())
}
