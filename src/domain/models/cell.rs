//! Work items ("cells") and their satellite rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Bug,
    Feature,
    Task,
    Epic,
    Chore,
    Message,
}

impl CellType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bug => "bug",
            Self::Feature => "feature",
            Self::Task => "task",
            Self::Epic => "epic",
            Self::Chore => "chore",
            Self::Message => "message",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "bug" => Some(Self::Bug),
            "feature" => Some(Self::Feature),
            "task" => Some(Self::Task),
            "epic" => Some(Self::Epic),
            "chore" => Some(Self::Chore),
            "message" => Some(Self::Message),
            _ => None,
        }
    }
}

impl std::fmt::Display for CellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
    Tombstone,
}

impl CellStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Closed => "closed",
            Self::Tombstone => "tombstone",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "blocked" => Some(Self::Blocked),
            "closed" => Some(Self::Closed),
            "tombstone" => Some(Self::Tombstone),
            _ => None,
        }
    }

    /// Statuses that make a cell count as an open blocker.
    pub fn is_workable(self) -> bool {
        matches!(self, Self::Open | Self::InProgress)
    }
}

impl std::fmt::Display for CellStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Edge kinds between cells. Only `blocks` and `parent-child` participate in
/// cycle prevention and the blocked cache; the rest are informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyKind {
    #[serde(rename = "blocks")]
    Blocks,
    #[serde(rename = "related")]
    Related,
    #[serde(rename = "parent-child")]
    ParentChild,
    #[serde(rename = "discovered-from")]
    DiscoveredFrom,
    #[serde(rename = "replies-to")]
    RepliesTo,
    #[serde(rename = "relates-to")]
    RelatesTo,
    #[serde(rename = "duplicates")]
    Duplicates,
    #[serde(rename = "supersedes")]
    Supersedes,
}

impl DependencyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::Related => "related",
            Self::ParentChild => "parent-child",
            Self::DiscoveredFrom => "discovered-from",
            Self::RepliesTo => "replies-to",
            Self::RelatesTo => "relates-to",
            Self::Duplicates => "duplicates",
            Self::Supersedes => "supersedes",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "blocks" => Some(Self::Blocks),
            "related" => Some(Self::Related),
            "parent-child" => Some(Self::ParentChild),
            "discovered-from" => Some(Self::DiscoveredFrom),
            "replies-to" => Some(Self::RepliesTo),
            "relates-to" => Some(Self::RelatesTo),
            "duplicates" => Some(Self::Duplicates),
            "supersedes" => Some(Self::Supersedes),
            _ => None,
        }
    }

    pub fn is_cycle_checked(self) -> bool {
        matches!(self, Self::Blocks | Self::ParentChild)
    }
}

impl std::fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A work item. Invariant: `status == Closed` iff `closed_at` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub id: String,
    pub project_key: String,
    pub cell_type: CellType,
    pub status: CellStatus,
    pub title: String,
    pub description: Option<String>,
    pub priority: u8,
    pub parent_id: Option<String>,
    pub assignee: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub closed_reason: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
}

impl Cell {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellDependency {
    pub cell_id: String,
    pub depends_on_id: String,
    pub relationship: DependencyKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellComment {
    pub id: String,
    pub cell_id: String,
    pub author: String,
    pub body: String,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Input for `create`. `id` may be caller-supplied (git-sync'd ids) or
/// generated; timestamps default to now and exist for JSONL import.
#[derive(Debug, Clone)]
pub struct NewCell {
    pub id: Option<String>,
    pub cell_type: CellType,
    pub title: String,
    pub description: Option<String>,
    pub priority: u8,
    pub parent_id: Option<String>,
    pub assignee: Option<String>,
    pub created_by: Option<String>,
}

impl NewCell {
    pub fn task(title: &str) -> Self {
        Self {
            id: None,
            cell_type: CellType::Task,
            title: title.to_string(),
            description: None,
            priority: 2,
            parent_id: None,
            assignee: None,
            created_by: None,
        }
    }

    pub fn with_type(mut self, cell_type: CellType) -> Self {
        self.cell_type = cell_type;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_assignee(mut self, assignee: &str) -> Self {
        self.assignee = Some(assignee.to_string());
        self
    }
}

/// Partial update for `update`; `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct CellPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<CellStatus>,
    pub priority: Option<u8>,
    pub assignee: Option<String>,
    pub parent_id: Option<String>,
}

/// Ready-work orderings. `Hybrid` is the default: items younger than 48
/// hours sort first by priority, older items sort by age.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyOrder {
    Priority,
    Oldest,
    #[default]
    Hybrid,
}

/// Optional ready-work filters; required labels use AND semantics.
#[derive(Debug, Clone, Default)]
pub struct ReadyFilter {
    pub assignee: Option<String>,
    pub unassigned: bool,
    pub labels: Vec<String>,
    pub limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in ["open", "in_progress", "blocked", "closed", "tombstone"] {
            assert_eq!(CellStatus::from_str(s).unwrap().as_str(), s);
        }
    }

    #[test]
    fn only_blocks_and_parent_child_are_cycle_checked() {
        assert!(DependencyKind::Blocks.is_cycle_checked());
        assert!(DependencyKind::ParentChild.is_cycle_checked());
        assert!(!DependencyKind::Related.is_cycle_checked());
        assert!(!DependencyKind::Duplicates.is_cycle_checked());
    }
}
