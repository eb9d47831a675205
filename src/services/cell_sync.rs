//! JSONL import/export for git-synchronized cell state.
//!
//! One sorted-key JSON object per line. The content hash is SHA-256 over
//! the canonical JSON of a cell's export object, so an unchanged cell
//! re-imports as a skip and `import(export(all))` is an empty diff.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::Path;

use crate::adapters::sqlite::format_datetime;
use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::cell::{Cell, CellStatus, CellType, DependencyKind};
use crate::domain::models::event::{self, types, NewEvent};
use crate::services::cells::CellService;
use crate::services::event_store::EventService;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub dry_run: bool,
}

#[derive(Clone)]
pub struct SyncService {
    events: EventService,
    cells: CellService,
}

impl SyncService {
    pub fn new(events: EventService, cells: CellService) -> Self {
        Self { events, cells }
    }

    // -- export --

    /// Export every non-deleted cell of the project as JSONL, ordered by id.
    pub async fn export_all(&self, project_key: &str) -> CoreResult<String> {
        let rows: Vec<crate::services::cells::CellRow> = sqlx::query_as(
            "SELECT * FROM cells WHERE project_key = ? AND deleted_at IS NULL ORDER BY id",
        )
        .bind(project_key)
        .fetch_all(self.events.pool())
        .await?;

        let mut lines = Vec::with_capacity(rows.len());
        for row in rows {
            let cell: Cell = row.try_into()?;
            let object = self.export_object(&cell).await?;
            lines.push(canonical_json(&object));
        }
        Ok(lines.join("\n"))
    }

    /// The export object for one cell, with nested dependencies, labels,
    /// and comments.
    pub async fn export_object(&self, cell: &Cell) -> CoreResult<Value> {
        let dependencies = self.cells.dependencies(&cell.id).await?;
        let labels = self.cells.labels(&cell.id).await?;
        let comments = self.cells.comments(&cell.id).await?;

        let mut deps: Vec<Value> = dependencies
            .iter()
            .map(|d| json!({ "depends_on_id": d.depends_on_id, "type": d.relationship.as_str() }))
            .collect();
        deps.sort_by_key(canonical_json);

        let mut object = json!({
            "id": cell.id,
            "title": cell.title,
            "status": cell.status.as_str(),
            "priority": cell.priority,
            "issue_type": cell.cell_type.as_str(),
            "created_at": format_datetime(cell.created_at),
            "updated_at": format_datetime(cell.updated_at),
            "dependencies": deps,
            "labels": labels,
            "comments": comments
                .iter()
                .map(|c| json!({ "author": c.author, "text": c.body }))
                .collect::<Vec<_>>(),
        });
        let map = object.as_object_mut().expect("export object is a map");
        if let Some(description) = &cell.description {
            map.insert("description".to_string(), json!(description));
        }
        if let Some(closed_at) = cell.closed_at {
            map.insert("closed_at".to_string(), json!(format_datetime(closed_at)));
        }
        if let Some(assignee) = &cell.assignee {
            map.insert("assignee".to_string(), json!(assignee));
        }
        if let Some(parent_id) = &cell.parent_id {
            map.insert("parent_id".to_string(), json!(parent_id));
        }
        Ok(object)
    }

    /// Drain the dirty set: write the dirty cells to `path` as JSONL and
    /// remove them from the set only after the write lands.
    pub async fn export_dirty(&self, project_key: &str, path: &Path) -> CoreResult<usize> {
        let dirty: Vec<(String,)> = sqlx::query_as(
            "SELECT d.cell_id FROM dirty_cells d \
             JOIN cells c ON c.id = d.cell_id \
             WHERE c.project_key = ? ORDER BY d.cell_id",
        )
        .bind(project_key)
        .fetch_all(self.events.pool())
        .await?;

        if dirty.is_empty() {
            return Ok(0);
        }

        let mut lines = Vec::new();
        for (cell_id,) in &dirty {
            let Some(cell) = self.cells.get(project_key, cell_id).await? else {
                continue;
            };
            if cell.is_deleted() {
                continue;
            }
            let object = self.export_object(&cell).await?;
            lines.push(canonical_json(&object));
        }

        std::fs::write(path, lines.join("\n"))
            .map_err(|e| CoreError::Internal(format!("dirty export write failed: {e}")))?;

        for (cell_id,) in &dirty {
            sqlx::query("DELETE FROM dirty_cells WHERE cell_id = ?")
                .bind(cell_id)
                .execute(self.events.pool())
                .await?;
        }
        Ok(dirty.len())
    }

    // -- import --

    /// Import JSONL produced by `export_all` (possibly from another store).
    /// Unchanged cells (equal content hash) are skipped; others are created
    /// or updated. `dry_run` reports counts without writing.
    pub async fn import(&self, project_key: &str, jsonl: &str, dry_run: bool) -> CoreResult<ImportReport> {
        let mut report = ImportReport { dry_run, ..Default::default() };

        for (line_no, line) in jsonl.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let incoming: CellExport = serde_json::from_str(line).map_err(|e| {
                CoreError::Invalid(format!("line {}: bad cell object: {e}", line_no + 1))
            })?;
            incoming.validate(line_no + 1)?;

            let incoming_hash = content_hash(&incoming.to_value());
            match self.cells.get(project_key, &incoming.id).await? {
                None => {
                    report.created += 1;
                    if !dry_run {
                        self.import_create(project_key, &incoming).await?;
                    }
                }
                Some(existing) => {
                    let existing_hash = content_hash(&self.export_object(&existing).await?);
                    if existing_hash == incoming_hash {
                        report.skipped += 1;
                    } else {
                        report.updated += 1;
                        if !dry_run {
                            self.import_update(project_key, &existing, &incoming).await?;
                        }
                    }
                }
            }
        }
        Ok(report)
    }

    async fn import_create(&self, project_key: &str, incoming: &CellExport) -> CoreResult<()> {
        let payload = event::CellCreated {
            id: incoming.id.clone(),
            cell_type: incoming.issue_type.clone(),
            status: incoming.status.clone(),
            title: incoming.title.clone(),
            description: incoming.description.clone(),
            priority: incoming.priority,
            parent_id: incoming.parent_id.clone(),
            assignee: incoming.assignee.clone(),
            created_by: None,
            created_at: incoming.created_at,
            updated_at: incoming.updated_at,
            closed_at: incoming.closed_at,
            closed_reason: None,
        };
        self.append(project_key, types::CELL_CREATED, &payload).await?;

        for dep in &incoming.dependencies {
            let payload = event::CellDepChanged {
                cell_id: incoming.id.clone(),
                depends_on_id: dep.depends_on_id.clone(),
                relationship: dep.dep_type.clone(),
            };
            self.append(project_key, types::CELL_DEP_ADDED, &payload).await?;
        }
        for label in &incoming.labels {
            let payload = event::CellLabelChanged {
                cell_id: incoming.id.clone(),
                label: label.clone(),
            };
            self.append(project_key, types::CELL_LABEL_ADDED, &payload).await?;
        }
        for comment in &incoming.comments {
            self.append_comment(project_key, &incoming.id, comment).await?;
        }
        Ok(())
    }

    async fn import_update(
        &self,
        project_key: &str,
        existing: &Cell,
        incoming: &CellExport,
    ) -> CoreResult<()> {
        let payload = event::CellUpdated {
            id: incoming.id.clone(),
            title: Some(incoming.title.clone()),
            description: incoming.description.clone(),
            status: Some(incoming.status.clone()),
            priority: Some(incoming.priority),
            assignee: incoming.assignee.clone(),
            parent_id: incoming.parent_id.clone(),
            updated_at: Some(incoming.updated_at),
            closed_at: incoming.closed_at,
        };
        self.append(project_key, types::CELL_UPDATED, &payload).await?;

        // Reconcile dependency edges.
        let current: BTreeSet<(String, String)> = self
            .cells
            .dependencies(&existing.id)
            .await?
            .into_iter()
            .map(|d| (d.depends_on_id, d.relationship.as_str().to_string()))
            .collect();
        let wanted: BTreeSet<(String, String)> = incoming
            .dependencies
            .iter()
            .map(|d| (d.depends_on_id.clone(), d.dep_type.clone()))
            .collect();

        for (depends_on_id, dep_type) in wanted.difference(&current) {
            let payload = event::CellDepChanged {
                cell_id: incoming.id.clone(),
                depends_on_id: depends_on_id.clone(),
                relationship: dep_type.clone(),
            };
            self.append(project_key, types::CELL_DEP_ADDED, &payload).await?;
        }
        for (depends_on_id, dep_type) in current.difference(&wanted) {
            let payload = event::CellDepChanged {
                cell_id: incoming.id.clone(),
                depends_on_id: depends_on_id.clone(),
                relationship: dep_type.clone(),
            };
            self.append(project_key, types::CELL_DEP_REMOVED, &payload).await?;
        }

        // Reconcile labels.
        let current_labels: BTreeSet<String> =
            self.cells.labels(&existing.id).await?.into_iter().collect();
        let wanted_labels: BTreeSet<String> = incoming.labels.iter().cloned().collect();
        for label in wanted_labels.difference(&current_labels) {
            let payload = event::CellLabelChanged {
                cell_id: incoming.id.clone(),
                label: label.clone(),
            };
            self.append(project_key, types::CELL_LABEL_ADDED, &payload).await?;
        }
        for label in current_labels.difference(&wanted_labels) {
            let payload = event::CellLabelChanged {
                cell_id: incoming.id.clone(),
                label: label.clone(),
            };
            self.append(project_key, types::CELL_LABEL_REMOVED, &payload).await?;
        }

        // Comments are append-only; bring over the ones we do not have yet.
        let current_comments: Vec<(String, String)> = self
            .cells
            .comments(&existing.id)
            .await?
            .into_iter()
            .map(|c| (c.author, c.body))
            .collect();
        for comment in &incoming.comments {
            let key = (comment.author.clone(), comment.text.clone());
            if !current_comments.contains(&key) {
                self.append_comment(project_key, &incoming.id, comment).await?;
            }
        }
        Ok(())
    }

    async fn append_comment(
        &self,
        project_key: &str,
        cell_id: &str,
        comment: &CommentExport,
    ) -> CoreResult<()> {
        let payload = event::CellCommentAdded {
            comment_id: format!("cmt-{}", uuid::Uuid::new_v4()),
            cell_id: cell_id.to_string(),
            author: comment.author.clone(),
            body: comment.text.clone(),
            parent_id: None,
        };
        self.append(project_key, types::CELL_COMMENT_ADDED, &payload).await
    }

    async fn append<T: serde::Serialize>(
        &self,
        project_key: &str,
        event_type: &str,
        payload: &T,
    ) -> CoreResult<()> {
        self.events
            .append(NewEvent::new(event_type, project_key, serde_json::to_value(payload)?))
            .await?;
        Ok(())
    }
}

/// `SHA-256(canonical-JSON(value))`, hex-encoded.
pub fn content_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize with object keys sorted at every level, independent of the
/// in-memory map ordering.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap_or_default(), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CellExport {
    id: String,
    title: String,
    #[serde(default)]
    description: Option<String>,
    status: String,
    priority: i64,
    issue_type: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    assignee: Option<String>,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    dependencies: Vec<DepExport>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    comments: Vec<CommentExport>,
}

#[derive(Debug, Clone, Deserialize)]
struct DepExport {
    depends_on_id: String,
    #[serde(rename = "type")]
    dep_type: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CommentExport {
    author: String,
    text: String,
}

impl CellExport {
    fn validate(&self, line: usize) -> CoreResult<()> {
        if self.id.trim().is_empty() {
            return Err(CoreError::Invalid(format!("line {line}: empty cell id")));
        }
        if CellStatus::from_str(&self.status).is_none() {
            return Err(CoreError::Invalid(format!("line {line}: unknown status '{}'", self.status)));
        }
        if CellType::from_str(&self.issue_type).is_none() {
            return Err(CoreError::Invalid(format!(
                "line {line}: unknown issue_type '{}'",
                self.issue_type
            )));
        }
        if !(0..=3).contains(&self.priority) {
            return Err(CoreError::Invalid(format!(
                "line {line}: priority {} out of range",
                self.priority
            )));
        }
        if self.status == "closed" && self.closed_at.is_none() {
            return Err(CoreError::Invalid(format!("line {line}: closed cell without closed_at")));
        }
        for dep in &self.dependencies {
            if DependencyKind::from_str(&dep.dep_type).is_none() {
                return Err(CoreError::Invalid(format!(
                    "line {line}: unknown dependency type '{}'",
                    dep.dep_type
                )));
            }
        }
        Ok(())
    }

    /// Normalized export object for hashing, matching `export_object`.
    fn to_value(&self) -> Value {
        let mut deps: Vec<Value> = self
            .dependencies
            .iter()
            .map(|d| json!({ "depends_on_id": d.depends_on_id, "type": d.dep_type }))
            .collect();
        deps.sort_by_key(canonical_json);
        let mut labels = self.labels.clone();
        labels.sort();

        let mut object = json!({
            "id": self.id,
            "title": self.title,
            "status": self.status,
            "priority": self.priority,
            "issue_type": self.issue_type,
            "created_at": format_datetime(self.created_at),
            "updated_at": format_datetime(self.updated_at),
            "dependencies": deps,
            "labels": labels,
            "comments": self.comments
                .iter()
                .map(|c| json!({ "author": c.author, "text": c.text }))
                .collect::<Vec<_>>(),
        });
        let map = object.as_object_mut().expect("export object is a map");
        if let Some(description) = &self.description {
            map.insert("description".to_string(), json!(description));
        }
        if let Some(closed_at) = self.closed_at {
            map.insert("closed_at".to_string(), json!(format_datetime(closed_at)));
        }
        if let Some(assignee) = &self.assignee {
            map.insert("assignee".to_string(), json!(assignee));
        }
        if let Some(parent_id) = &self.parent_id {
            map.insert("parent_id".to_string(), json!(parent_id));
        }
        object
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = json!({ "b": 1, "a": { "z": true, "m": [3, 1] } });
        assert_eq!(canonical_json(&value), r#"{"a":{"m":[3,1],"z":true},"b":1}"#);
    }

    #[test]
    fn content_hash_is_stable_under_key_order() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":"z"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":"z","x":1}"#).unwrap();
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn content_hash_differs_on_content_change() {
        assert_ne!(content_hash(&json!({"x": 1})), content_hash(&json!({"x": 2})));
    }
}
