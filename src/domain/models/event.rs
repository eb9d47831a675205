//! Event envelope and typed payloads for the append-only log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known event type tags. Cell events all share the `cell_` prefix;
/// projections treat any other unknown tag as a no-op.
pub mod types {
    pub const AGENT_REGISTERED: &str = "agent_registered";
    pub const AGENT_ACTIVE: &str = "agent_active";
    pub const MESSAGE_SENT: &str = "message_sent";
    pub const MESSAGE_READ: &str = "message_read";
    pub const MESSAGE_ACKED: &str = "message_acked";
    pub const RESERVATION_ACQUIRED: &str = "reservation_acquired";
    pub const RESERVATION_RELEASED: &str = "reservation_released";
    pub const RESERVATION_EXPIRED: &str = "reservation_expired";
    pub const LOCK_ACQUIRED: &str = "lock_acquired";
    pub const LOCK_RELEASED: &str = "lock_released";
    pub const CELL_CREATED: &str = "cell_created";
    pub const CELL_UPDATED: &str = "cell_updated";
    pub const CELL_CLOSED: &str = "cell_closed";
    pub const CELL_DELETED: &str = "cell_deleted";
    pub const CELL_RESTORED: &str = "cell_restored";
    pub const CELL_DEP_ADDED: &str = "cell_dep_added";
    pub const CELL_DEP_REMOVED: &str = "cell_dep_removed";
    pub const CELL_LABEL_ADDED: &str = "cell_label_added";
    pub const CELL_LABEL_REMOVED: &str = "cell_label_removed";
    pub const CELL_COMMENT_ADDED: &str = "cell_comment_added";
    pub const CELL_VALIDATED: &str = "cell_validated";
    pub const MEMORY_STORED: &str = "memory_stored";
    pub const MEMORY_REMOVED: &str = "memory_removed";

    pub const CELL_PREFIX: &str = "cell_";
}

/// A committed row of the event log. `sequence` equals `id` by construction;
/// it is the total order every reader depends on. `timestamp` is the
/// producer's wall clock in milliseconds and may go backwards across agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub sequence: i64,
    pub event_type: String,
    pub project_key: String,
    pub timestamp: i64,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn is_cell_event(&self) -> bool {
        self.event_type.starts_with(types::CELL_PREFIX)
    }

    /// Producer wall clock as a UTC datetime (millisecond precision).
    pub fn occurred_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.timestamp).unwrap_or_else(Utc::now)
    }
}

/// An event not yet appended. The store assigns `id`/`sequence` on insert.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub project_key: String,
    pub timestamp: i64,
    pub data: serde_json::Value,
}

impl NewEvent {
    pub fn new(event_type: &str, project_key: &str, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            project_key: project_key.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            data,
        }
    }

    pub fn at(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = timestamp_ms;
        self
    }
}

/// Filter for event reads. All clauses are conjunctive; results are ordered
/// by sequence ascending.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub project_key: Option<String>,
    pub types: Vec<String>,
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
    pub after_sequence: Option<i64>,
    pub cell_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project(mut self, key: &str) -> Self {
        self.project_key = Some(key.to_string());
        self
    }

    pub fn types(mut self, types: &[&str]) -> Self {
        self.types = types.iter().map(|t| (*t).to_string()).collect();
        self
    }

    pub fn since(mut self, ms: i64) -> Self {
        self.since_ms = Some(ms);
        self
    }

    pub fn until(mut self, ms: i64) -> Self {
        self.until_ms = Some(ms);
        self
    }

    pub fn after_sequence(mut self, seq: i64) -> Self {
        self.after_sequence = Some(seq);
        self
    }

    pub fn cell(mut self, cell_id: &str) -> Self {
        self.cell_id = Some(cell_id.to_string());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }
}

// -- Typed payloads carried in `EventRecord::data` --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistered {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentActive {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSent {
    pub message_id: String,
    pub from_agent: String,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub importance: String,
    pub ack_required: bool,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageReceipt {
    pub message_id: String,
    pub agent_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationAcquired {
    pub handle_id: String,
    pub agent_name: String,
    /// One reservation row is materialized per `(row_id, pattern)` entry.
    pub patterns: Vec<ReservedPattern>,
    pub exclusive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservedPattern {
    pub row_id: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationReleased {
    pub handle_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationExpired {
    pub reservation_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockAcquired {
    pub resource: String,
    pub holder: String,
    /// Fencing token, strictly increasing per resource.
    pub seq: i64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockReleased {
    pub resource: String,
    pub holder: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellCreated {
    pub id: String,
    pub cell_type: String,
    pub status: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_reason: Option<String>,
}

/// Partial update; `None` fields are left untouched. `updated_at` is set
/// from the carried value when present (JSONL import), else the event time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellUpdated {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Explicit close time; only meaningful when `status` is `closed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellClosed {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellDeleted {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellRestored {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellDepChanged {
    pub cell_id: String,
    pub depends_on_id: String,
    pub relationship: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellLabelChanged {
    pub cell_id: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellCommentAdded {
    pub comment_id: String,
    pub cell_id: String,
    pub author: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellValidated {
    pub cell_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryAudit {
    pub memory_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_prefix_matches_cell_events() {
        let rec = EventRecord {
            id: 1,
            sequence: 1,
            event_type: types::CELL_CREATED.to_string(),
            project_key: "p".to_string(),
            timestamp: 0,
            data: serde_json::json!({}),
            created_at: Utc::now(),
        };
        assert!(rec.is_cell_event());
    }

    #[test]
    fn filter_builder_accumulates_clauses() {
        let f = EventFilter::new()
            .project("p")
            .types(&[types::MESSAGE_SENT])
            .after_sequence(10)
            .limit(5);
        assert_eq!(f.project_key.as_deref(), Some("p"));
        assert_eq!(f.types, vec![types::MESSAGE_SENT.to_string()]);
        assert_eq!(f.after_sequence, Some(10));
        assert_eq!(f.limit, Some(5));
    }
}
