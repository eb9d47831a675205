//! Cell graph: hierarchical work items, dependency edges with cycle
//! prevention, the blocked cache, and the ready-work query.
//!
//! Every mutation goes through the event log; the tables are written only
//! by projection handlers, inside the append transaction.

use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::adapters::sqlite::{format_datetime, parse_datetime, parse_optional_datetime};
use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::cell::{
    Cell, CellComment, CellDependency, CellPatch, CellStatus, CellType, DependencyKind, NewCell,
    ReadyFilter, ReadyOrder,
};
use crate::domain::models::event::{
    self, types, NewEvent,
};
use crate::services::event_store::EventService;

/// Post-close validations run fire-and-forget but never unbounded: at most
/// this many run concurrently, the rest queue on the semaphore.
pub const VALIDATION_POOL_SIZE: usize = 4;

/// Items younger than this sort by priority under the hybrid ordering;
/// older items sort by age.
const HYBRID_AGE_CUTOFF_HOURS: i64 = 48;

#[derive(Clone)]
pub struct CellService {
    events: EventService,
    validations: Arc<Semaphore>,
}

impl CellService {
    pub fn new(events: EventService) -> Self {
        Self {
            events,
            validations: Arc::new(Semaphore::new(VALIDATION_POOL_SIZE)),
        }
    }

    fn pool(&self) -> &SqlitePool {
        self.events.pool()
    }

    // -- CRUD --

    pub async fn create(&self, project_key: &str, new: NewCell) -> CoreResult<Cell> {
        if new.priority > 3 {
            return Err(CoreError::Invalid(format!(
                "priority {} out of range 0..=3",
                new.priority
            )));
        }
        if new.title.trim().is_empty() {
            return Err(CoreError::Invalid("cell title must not be empty".to_string()));
        }

        let id = new.id.clone().unwrap_or_else(|| format!("cell-{}", Uuid::new_v4()));
        if self.get(project_key, &id).await?.is_some() {
            return Err(CoreError::Conflict(format!("cell id already exists: {id}")));
        }
        if let Some(parent_id) = &new.parent_id {
            let parent = self.require(project_key, parent_id).await?;
            if parent.is_deleted() {
                return Err(CoreError::Invalid(format!("parent cell is deleted: {parent_id}")));
            }
        }

        let now = Utc::now();
        let payload = event::CellCreated {
            id: id.clone(),
            cell_type: new.cell_type.as_str().to_string(),
            status: CellStatus::Open.as_str().to_string(),
            title: new.title,
            description: new.description,
            priority: i64::from(new.priority),
            parent_id: new.parent_id,
            assignee: new.assignee,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
            closed_at: None,
            closed_reason: None,
        };
        self.append(project_key, types::CELL_CREATED, &payload).await?;
        self.require(project_key, &id).await
    }

    pub async fn get(&self, project_key: &str, id: &str) -> CoreResult<Option<Cell>> {
        let row: Option<CellRow> = sqlx::query_as(
            "SELECT * FROM cells WHERE project_key = ? AND id = ?",
        )
        .bind(project_key)
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    pub async fn require(&self, project_key: &str, id: &str) -> CoreResult<Cell> {
        self.get(project_key, id)
            .await?
            .ok_or_else(|| CoreError::not_found("cell", id))
    }

    pub async fn update(&self, project_key: &str, id: &str, patch: CellPatch) -> CoreResult<Cell> {
        let current = self.require(project_key, id).await?;
        if current.is_deleted() {
            return Err(CoreError::Invalid(format!("cell is deleted: {id}")));
        }
        if let Some(priority) = patch.priority {
            if priority > 3 {
                return Err(CoreError::Invalid(format!("priority {priority} out of range 0..=3")));
            }
        }
        if let Some(parent_id) = &patch.parent_id {
            if parent_id == id {
                return Err(CoreError::Invalid("cell cannot be its own parent".to_string()));
            }
            let parent = self.require(project_key, parent_id).await?;
            if parent.is_deleted() {
                return Err(CoreError::Invalid(format!("parent cell is deleted: {parent_id}")));
            }
        }

        let payload = event::CellUpdated {
            id: id.to_string(),
            title: patch.title,
            description: patch.description,
            status: patch.status.map(|s| s.as_str().to_string()),
            priority: patch.priority.map(i64::from),
            assignee: patch.assignee,
            parent_id: patch.parent_id,
            updated_at: None,
            closed_at: None,
        };
        self.append(project_key, types::CELL_UPDATED, &payload).await?;
        self.require(project_key, id).await
    }

    /// Close the cell and kick off a post-close validation on the bounded
    /// worker pool.
    pub async fn close(&self, project_key: &str, id: &str, reason: Option<&str>) -> CoreResult<Cell> {
        let current = self.require(project_key, id).await?;
        if current.is_deleted() {
            return Err(CoreError::Invalid(format!("cell is deleted: {id}")));
        }

        let payload = event::CellClosed {
            id: id.to_string(),
            reason: reason.map(str::to_string),
        };
        self.append(project_key, types::CELL_CLOSED, &payload).await?;

        self.spawn_post_close_validation(project_key.to_string(), id.to_string());
        self.require(project_key, id).await
    }

    /// Soft delete; the row stays for restore and audit.
    pub async fn delete(&self, project_key: &str, id: &str, deleted_by: Option<&str>) -> CoreResult<()> {
        self.require(project_key, id).await?;
        let payload = event::CellDeleted {
            id: id.to_string(),
            deleted_by: deleted_by.map(str::to_string),
        };
        self.append(project_key, types::CELL_DELETED, &payload).await?;
        Ok(())
    }

    pub async fn restore(&self, project_key: &str, id: &str) -> CoreResult<Cell> {
        let current = self.require(project_key, id).await?;
        if !current.is_deleted() {
            return Ok(current);
        }
        let payload = event::CellRestored { id: id.to_string() };
        self.append(project_key, types::CELL_RESTORED, &payload).await?;
        self.require(project_key, id).await
    }

    // -- dependencies --

    /// Add an edge `cell -> depends_on`. For `blocks` and `parent-child`
    /// the reverse-reachability check rejects cycles; other kinds are
    /// informational and unchecked.
    pub async fn add_dependency(
        &self,
        project_key: &str,
        cell_id: &str,
        depends_on_id: &str,
        relationship: DependencyKind,
    ) -> CoreResult<()> {
        if cell_id == depends_on_id {
            return Err(CoreError::Invalid("cell cannot depend on itself".to_string()));
        }
        self.require(project_key, cell_id).await?;
        self.require(project_key, depends_on_id).await?;

        if relationship.is_cycle_checked()
            && self.reachable(depends_on_id, cell_id, relationship).await?
        {
            return Err(CoreError::CycleDetected(cell_id.to_string()));
        }

        let payload = event::CellDepChanged {
            cell_id: cell_id.to_string(),
            depends_on_id: depends_on_id.to_string(),
            relationship: relationship.as_str().to_string(),
        };
        self.append(project_key, types::CELL_DEP_ADDED, &payload).await?;
        Ok(())
    }

    pub async fn remove_dependency(
        &self,
        project_key: &str,
        cell_id: &str,
        depends_on_id: &str,
        relationship: DependencyKind,
    ) -> CoreResult<()> {
        let payload = event::CellDepChanged {
            cell_id: cell_id.to_string(),
            depends_on_id: depends_on_id.to_string(),
            relationship: relationship.as_str().to_string(),
        };
        self.append(project_key, types::CELL_DEP_REMOVED, &payload).await?;
        Ok(())
    }

    /// Is `target` reachable from `start` along `relationship` edges in
    /// dependency direction?
    async fn reachable(
        &self,
        start: &str,
        target: &str,
        relationship: DependencyKind,
    ) -> CoreResult<bool> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut frontier = vec![start.to_string()];
        seen.insert(start.to_string());

        while let Some(current) = frontier.pop() {
            let next: Vec<(String,)> = sqlx::query_as(
                "SELECT depends_on_id FROM cell_dependencies WHERE cell_id = ? AND relationship = ?",
            )
            .bind(&current)
            .bind(relationship.as_str())
            .fetch_all(self.pool())
            .await?;

            for (dep,) in next {
                if dep == target {
                    return Ok(true);
                }
                if seen.insert(dep.clone()) {
                    frontier.push(dep);
                }
            }
        }
        Ok(false)
    }

    pub async fn dependencies(&self, cell_id: &str) -> CoreResult<Vec<CellDependency>> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT cell_id, depends_on_id, relationship, created_at FROM cell_dependencies \
             WHERE cell_id = ? ORDER BY depends_on_id, relationship",
        )
        .bind(cell_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|(cell_id, depends_on_id, relationship, created_at)| {
                Ok(CellDependency {
                    cell_id,
                    depends_on_id,
                    relationship: DependencyKind::from_str(&relationship)
                        .unwrap_or(DependencyKind::Related),
                    created_at: parse_datetime(&created_at)?,
                })
            })
            .collect()
    }

    // -- labels / comments --

    pub async fn add_label(&self, project_key: &str, cell_id: &str, label: &str) -> CoreResult<()> {
        self.require(project_key, cell_id).await?;
        let payload = event::CellLabelChanged {
            cell_id: cell_id.to_string(),
            label: label.to_string(),
        };
        self.append(project_key, types::CELL_LABEL_ADDED, &payload).await?;
        Ok(())
    }

    pub async fn remove_label(&self, project_key: &str, cell_id: &str, label: &str) -> CoreResult<()> {
        let payload = event::CellLabelChanged {
            cell_id: cell_id.to_string(),
            label: label.to_string(),
        };
        self.append(project_key, types::CELL_LABEL_REMOVED, &payload).await?;
        Ok(())
    }

    pub async fn labels(&self, cell_id: &str) -> CoreResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT label FROM cell_labels WHERE cell_id = ? ORDER BY label")
                .bind(cell_id)
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(|(l,)| l).collect())
    }

    pub async fn add_comment(
        &self,
        project_key: &str,
        cell_id: &str,
        author: &str,
        body: &str,
        parent_id: Option<&str>,
    ) -> CoreResult<String> {
        self.require(project_key, cell_id).await?;
        let comment_id = format!("cmt-{}", Uuid::new_v4());
        let payload = event::CellCommentAdded {
            comment_id: comment_id.clone(),
            cell_id: cell_id.to_string(),
            author: author.to_string(),
            body: body.to_string(),
            parent_id: parent_id.map(str::to_string),
        };
        self.append(project_key, types::CELL_COMMENT_ADDED, &payload).await?;
        Ok(comment_id)
    }

    pub async fn comments(&self, cell_id: &str) -> CoreResult<Vec<CellComment>> {
        let rows: Vec<CommentRow> = sqlx::query_as(
            "SELECT id, cell_id, author, body, parent_id, created_at, updated_at \
             FROM cell_comments WHERE cell_id = ? ORDER BY created_at, id",
        )
        .bind(cell_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    // -- blocked cache / ready work --

    /// Open blocker ids from the cache; empty when the cell is unblocked.
    pub async fn blocked_by(&self, cell_id: &str) -> CoreResult<Vec<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT blocker_ids FROM blocked_cells WHERE cell_id = ?")
                .bind(cell_id)
                .fetch_optional(self.pool())
                .await?;
        match row {
            Some((json,)) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    /// Unblocked work: open or in-progress, not deleted, absent from the
    /// blocked cache.
    pub async fn ready_work(
        &self,
        project_key: &str,
        order: ReadyOrder,
        filter: &ReadyFilter,
    ) -> CoreResult<Vec<Cell>> {
        let mut sql = String::from(
            "SELECT c.* FROM cells c \
             WHERE c.project_key = ? AND c.deleted_at IS NULL \
               AND c.status IN ('open', 'in_progress') \
               AND c.id NOT IN (SELECT cell_id FROM blocked_cells)",
        );
        let mut binds: Vec<String> = vec![project_key.to_string()];

        if let Some(assignee) = &filter.assignee {
            sql.push_str(" AND c.assignee = ?");
            binds.push(assignee.clone());
        }
        if filter.unassigned {
            sql.push_str(" AND c.assignee IS NULL");
        }
        for label in &filter.labels {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM cell_labels l WHERE l.cell_id = c.id AND l.label = ?)",
            );
            binds.push(label.clone());
        }

        match order {
            ReadyOrder::Priority => {
                sql.push_str(" ORDER BY c.priority ASC, c.created_at ASC");
            }
            ReadyOrder::Oldest => {
                sql.push_str(" ORDER BY c.created_at ASC");
            }
            ReadyOrder::Hybrid => {
                let cutoff =
                    format_datetime(Utc::now() - Duration::hours(HYBRID_AGE_CUTOFF_HOURS));
                sql.push_str(
                    " ORDER BY CASE WHEN c.created_at >= ? THEN 0 ELSE 1 END, \
                       CASE WHEN c.created_at >= ? THEN c.priority ELSE 0 END ASC, \
                       c.created_at ASC",
                );
                binds.push(cutoff.clone());
                binds.push(cutoff);
            }
        }

        let limit = filter.limit.unwrap_or(50);
        sql.push_str(&format!(" LIMIT {limit}"));

        let mut query = sqlx::query_as::<_, CellRow>(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(self.pool()).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Resolve a hash fragment against cell ids: zero matches is absent,
    /// one is the hit, more is `Ambiguous`.
    pub async fn resolve_partial_id(
        &self,
        project_key: &str,
        fragment: &str,
    ) -> CoreResult<Option<Cell>> {
        let trimmed = fragment.trim();
        if trimmed.is_empty() {
            return Err(CoreError::Invalid("empty id fragment".to_string()));
        }

        let rows: Vec<CellRow> = sqlx::query_as(
            "SELECT * FROM cells WHERE project_key = ? AND instr(id, ?) > 0 ORDER BY id LIMIT 2",
        )
        .bind(project_key)
        .bind(trimmed)
        .fetch_all(self.pool())
        .await?;

        match rows.len() {
            0 => Ok(None),
            1 => Ok(Some(rows.into_iter().next().unwrap().try_into()?)),
            _ => Err(CoreError::Ambiguous {
                fragment: trimmed.to_string(),
                count: self.count_partial_matches(project_key, trimmed).await?,
            }),
        }
    }

    async fn count_partial_matches(&self, project_key: &str, fragment: &str) -> CoreResult<usize> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM cells WHERE project_key = ? AND instr(id, ?) > 0",
        )
        .bind(project_key)
        .bind(fragment)
        .fetch_one(self.pool())
        .await?;
        Ok(row.0 as usize)
    }

    // -- post-close validation --

    fn spawn_post_close_validation(&self, project_key: String, cell_id: String) {
        let service = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = service.validations.acquire().await else {
                return;
            };
            if let Err(error) = service.validate_closed(&project_key, &cell_id).await {
                tracing::warn!(%cell_id, %error, "post-close validation failed to run");
            }
        });
    }

    /// Checks a closed cell leaves the graph consistent: closed_at is set
    /// and no non-deleted child is still open. Outcome lands in the log as
    /// a `cell_validated` event.
    async fn validate_closed(&self, project_key: &str, cell_id: &str) -> CoreResult<()> {
        let cell = self.require(project_key, cell_id).await?;
        let mut problems: Vec<String> = Vec::new();

        if cell.status == CellStatus::Closed && cell.closed_at.is_none() {
            problems.push("closed without closed_at".to_string());
        }

        let open_children: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM cells WHERE parent_id = ? AND deleted_at IS NULL \
             AND status IN ('open', 'in_progress')",
        )
        .bind(cell_id)
        .fetch_all(self.pool())
        .await?;
        if !open_children.is_empty() {
            problems.push(format!(
                "open children remain: {}",
                open_children.iter().map(|(id,)| id.as_str()).collect::<Vec<_>>().join(", ")
            ));
        }

        let payload = event::CellValidated {
            cell_id: cell_id.to_string(),
            ok: problems.is_empty(),
            detail: if problems.is_empty() { None } else { Some(problems.join("; ")) },
        };
        self.append(project_key, types::CELL_VALIDATED, &payload).await?;
        Ok(())
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

#[derive(sqlx::FromRow)]
pub(crate) struct CellRow {
    pub id: String,
    pub project_key: String,
    pub cell_type: String,
    pub status: String,
    pub title: String,
    pub description: Option<String>,
    pub priority: i64,
    pub parent_id: Option<String>,
    pub assignee: Option<String>,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub closed_at: Option<String>,
    pub closed_reason: Option<String>,
    pub deleted_at: Option<String>,
    pub deleted_by: Option<String>,
}

impl TryFrom<CellRow> for Cell {
    type Error = CoreError;

    fn try_from(row: CellRow) -> Result<Self, Self::Error> {
        Ok(Cell {
            id: row.id,
            project_key: row.project_key,
            cell_type: CellType::from_str(&row.cell_type).unwrap_or(CellType::Task),
            status: CellStatus::from_str(&row.status).unwrap_or(CellStatus::Open),
            title: row.title,
            description: row.description,
            priority: row.priority.clamp(0, 3) as u8,
            parent_id: row.parent_id,
            assignee: row.assignee,
            created_by: row.created_by,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
            closed_at: parse_optional_datetime(row.closed_at)?,
            closed_reason: row.closed_reason,
            deleted_at: parse_optional_datetime(row.deleted_at)?,
            deleted_by: row.deleted_by,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CommentRow {
    id: String,
    cell_id: String,
    author: String,
    body: String,
    parent_id: Option<String>,
    created_at: String,
    updated_at: Option<String>,
}

impl TryFrom<CommentRow> for CellComment {
    type Error = CoreError;

    fn try_from(row: CommentRow) -> Result<Self, Self::Error> {
        Ok(CellComment {
            id: row.id,
            cell_id: row.cell_id,
            author: row.author,
            body: row.body,
            parent_id: row.parent_id,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_optional_datetime(row.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    async fn service() -> CellService {
        let pool = create_migrated_test_pool().await.unwrap();
        CellService::new(EventService::new(pool))
    }

    #[tokio::test]
    async fn create_and_close_keeps_closed_at_invariant() {
        let cells = service().await;
        let cell = cells.create("/p", NewCell::task("fix login")).await.unwrap();
        assert_eq!(cell.status, CellStatus::Open);
        assert!(cell.closed_at.is_none());

        let closed = cells.close("/p", &cell.id, Some("done")).await.unwrap();
        assert_eq!(closed.status, CellStatus::Closed);
        assert!(closed.closed_at.is_some());
        assert_eq!(closed.closed_reason.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn reopen_clears_closed_at() {
        let cells = service().await;
        let cell = cells.create("/p", NewCell::task("t")).await.unwrap();
        cells.close("/p", &cell.id, None).await.unwrap();

        let patch = CellPatch { status: Some(CellStatus::Open), ..Default::default() };
        let reopened = cells.update("/p", &cell.id, patch).await.unwrap();
        assert_eq!(reopened.status, CellStatus::Open);
        assert!(reopened.closed_at.is_none());
    }

    #[tokio::test]
    async fn duplicate_id_is_a_conflict() {
        let cells = service().await;
        cells.create("/p", NewCell::task("a").with_id("cell-x")).await.unwrap();
        let result = cells.create("/p", NewCell::task("b").with_id("cell-x")).await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn missing_parent_is_rejected() {
        let cells = service().await;
        let result = cells.create("/p", NewCell::task("t").with_parent("ghost")).await;
        assert!(matches!(result, Err(CoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn self_dependency_is_invalid() {
        let cells = service().await;
        let cell = cells.create("/p", NewCell::task("t")).await.unwrap();
        let result = cells
            .add_dependency("/p", &cell.id, &cell.id, DependencyKind::Blocks)
            .await;
        assert!(matches!(result, Err(CoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn blocks_cycle_is_detected() {
        let cells = service().await;
        let x = cells.create("/p", NewCell::task("x")).await.unwrap();
        let y = cells.create("/p", NewCell::task("y")).await.unwrap();

        cells.add_dependency("/p", &x.id, &y.id, DependencyKind::Blocks).await.unwrap();
        let result = cells.add_dependency("/p", &y.id, &x.id, DependencyKind::Blocks).await;
        assert!(matches!(result, Err(CoreError::CycleDetected(_))));
    }

    #[tokio::test]
    async fn informational_edges_skip_the_cycle_check() {
        let cells = service().await;
        let x = cells.create("/p", NewCell::task("x")).await.unwrap();
        let y = cells.create("/p", NewCell::task("y")).await.unwrap();

        cells.add_dependency("/p", &x.id, &y.id, DependencyKind::Related).await.unwrap();
        cells.add_dependency("/p", &y.id, &x.id, DependencyKind::Related).await.unwrap();
    }

    #[tokio::test]
    async fn transitive_blocks_cycle_is_detected() {
        let cells = service().await;
        let a = cells.create("/p", NewCell::task("a")).await.unwrap();
        let b = cells.create("/p", NewCell::task("b")).await.unwrap();
        let c = cells.create("/p", NewCell::task("c")).await.unwrap();

        cells.add_dependency("/p", &a.id, &b.id, DependencyKind::Blocks).await.unwrap();
        cells.add_dependency("/p", &b.id, &c.id, DependencyKind::Blocks).await.unwrap();
        let result = cells.add_dependency("/p", &c.id, &a.id, DependencyKind::Blocks).await;
        assert!(matches!(result, Err(CoreError::CycleDetected(_))));
    }

    #[tokio::test]
    async fn blocked_cache_tracks_open_blockers() {
        let cells = service().await;
        let blocker = cells.create("/p", NewCell::task("blocker")).await.unwrap();
        let blocked = cells.create("/p", NewCell::task("blocked")).await.unwrap();

        cells
            .add_dependency("/p", &blocked.id, &blocker.id, DependencyKind::Blocks)
            .await
            .unwrap();
        assert_eq!(cells.blocked_by(&blocked.id).await.unwrap(), vec![blocker.id.clone()]);

        cells.close("/p", &blocker.id, None).await.unwrap();
        assert!(cells.blocked_by(&blocked.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleted_blocker_unblocks_dependents() {
        let cells = service().await;
        let blocker = cells.create("/p", NewCell::task("blocker")).await.unwrap();
        let blocked = cells.create("/p", NewCell::task("blocked")).await.unwrap();
        cells
            .add_dependency("/p", &blocked.id, &blocker.id, DependencyKind::Blocks)
            .await
            .unwrap();

        cells.delete("/p", &blocker.id, Some("gc")).await.unwrap();
        assert!(cells.blocked_by(&blocked.id).await.unwrap().is_empty());

        cells.restore("/p", &blocker.id).await.unwrap();
        assert_eq!(cells.blocked_by(&blocked.id).await.unwrap(), vec![blocker.id.clone()]);
    }

    #[tokio::test]
    async fn ready_work_excludes_blocked_and_closed() {
        let cells = service().await;
        let blocker = cells.create("/p", NewCell::task("blocker")).await.unwrap();
        let blocked = cells.create("/p", NewCell::task("blocked")).await.unwrap();
        let closed = cells.create("/p", NewCell::task("closed")).await.unwrap();
        cells
            .add_dependency("/p", &blocked.id, &blocker.id, DependencyKind::Blocks)
            .await
            .unwrap();
        cells.close("/p", &closed.id, None).await.unwrap();

        let ready = cells
            .ready_work("/p", ReadyOrder::Priority, &ReadyFilter::default())
            .await
            .unwrap();
        let ids: Vec<&str> = ready.iter().map(|c| c.id.as_str()).collect();
        assert!(ids.contains(&blocker.id.as_str()));
        assert!(!ids.contains(&blocked.id.as_str()));
        assert!(!ids.contains(&closed.id.as_str()));
    }

    #[tokio::test]
    async fn ready_work_label_filter_uses_and_semantics() {
        let cells = service().await;
        let both = cells.create("/p", NewCell::task("both")).await.unwrap();
        let one = cells.create("/p", NewCell::task("one")).await.unwrap();
        cells.add_label("/p", &both.id, "urgent").await.unwrap();
        cells.add_label("/p", &both.id, "backend").await.unwrap();
        cells.add_label("/p", &one.id, "urgent").await.unwrap();

        let filter = ReadyFilter {
            labels: vec!["urgent".to_string(), "backend".to_string()],
            ..Default::default()
        };
        let ready = cells.ready_work("/p", ReadyOrder::Priority, &filter).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, both.id);
    }

    #[tokio::test]
    async fn partial_id_resolution() {
        let cells = service().await;
        cells.create("/p", NewCell::task("a").with_id("cell-abc123")).await.unwrap();
        cells.create("/p", NewCell::task("b").with_id("cell-def456")).await.unwrap();

        let hit = cells.resolve_partial_id("/p", "abc").await.unwrap();
        assert_eq!(hit.unwrap().id, "cell-abc123");

        assert!(cells.resolve_partial_id("/p", "zzz").await.unwrap().is_none());

        let ambiguous = cells.resolve_partial_id("/p", "cell-").await;
        assert!(matches!(ambiguous, Err(CoreError::Ambiguous { .. })));
    }
}
