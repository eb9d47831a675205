//! Agent registry projection model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named participant in a project's swarm. Materialized from the first
/// `agent_registered` event for the `(project_key, name)` pair;
/// `last_active_at` advances whenever an event mentions the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub project_key: String,
    pub name: String,
    pub program: Option<String>,
    pub model: Option<String>,
    pub task_description: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}
