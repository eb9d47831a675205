//! Agent registry operations.

use sqlx::SqlitePool;

use crate::adapters::sqlite::parse_datetime;
use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::event::{types, AgentActive, AgentRegistered, NewEvent};
use crate::domain::models::Agent;
use crate::services::event_store::EventService;

#[derive(Clone)]
pub struct AgentService {
    events: EventService,
}

impl AgentService {
    pub fn new(events: EventService) -> Self {
        Self { events }
    }

    fn pool(&self) -> &SqlitePool {
        self.events.pool()
    }

    /// Register an agent. Re-registering the same `(project, name)` pair is
    /// allowed and only advances `last_active_at`.
    pub async fn register(
        &self,
        project_key: &str,
        name: &str,
        program: Option<&str>,
        model: Option<&str>,
        task_description: Option<&str>,
    ) -> CoreResult<Agent> {
        if name.trim().is_empty() {
            return Err(CoreError::Invalid("agent name must not be empty".to_string()));
        }
        let payload = AgentRegistered {
            name: name.to_string(),
            program: program.map(str::to_string),
            model: model.map(str::to_string),
            task_description: task_description.map(str::to_string),
        };
        self.events
            .append(NewEvent::new(
                types::AGENT_REGISTERED,
                project_key,
                serde_json::to_value(&payload)?,
            ))
            .await?;

        self.get(project_key, name)
            .await?
            .ok_or_else(|| CoreError::Internal(format!("agent row missing after register: {name}")))
    }

    /// Heartbeat: records activity without re-registering.
    pub async fn touch(&self, project_key: &str, name: &str) -> CoreResult<()> {
        let payload = AgentActive { name: name.to_string() };
        self.events
            .append(NewEvent::new(
                types::AGENT_ACTIVE,
                project_key,
                serde_json::to_value(&payload)?,
            ))
            .await?;
        Ok(())
    }

    pub async fn get(&self, project_key: &str, name: &str) -> CoreResult<Option<Agent>> {
        let row: Option<AgentRow> = sqlx::query_as(
            "SELECT project_key, name, program, model, task_description, registered_at, last_active_at \
             FROM agents WHERE project_key = ? AND name = ?",
        )
        .bind(project_key)
        .bind(name)
        .fetch_optional(self.pool())
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    pub async fn list(&self, project_key: &str) -> CoreResult<Vec<Agent>> {
        let rows: Vec<AgentRow> = sqlx::query_as(
            "SELECT project_key, name, program, model, task_description, registered_at, last_active_at \
             FROM agents WHERE project_key = ? ORDER BY last_active_at DESC",
        )
        .bind(project_key)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    project_key: String,
    name: String,
    program: Option<String>,
    model: Option<String>,
    task_description: Option<String>,
    registered_at: String,
    last_active_at: String,
}

impl TryFrom<AgentRow> for Agent {
    type Error = CoreError;

    fn try_from(row: AgentRow) -> Result<Self, Self::Error> {
        Ok(Agent {
            project_key: row.project_key,
            name: row.name,
            program: row.program,
            model: row.model,
            task_description: row.task_description,
            registered_at: parse_datetime(&row.registered_at)?,
            last_active_at: parse_datetime(&row.last_active_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    async fn service() -> AgentService {
        let pool = create_migrated_test_pool().await.unwrap();
        AgentService::new(EventService::new(pool))
    }

    #[tokio::test]
    async fn register_and_get() {
        let agents = service().await;
        let agent = agents
            .register("/p", "worker-1", Some("claude"), Some("opus"), Some("fix auth"))
            .await
            .unwrap();
        assert_eq!(agent.name, "worker-1");
        assert_eq!(agent.program.as_deref(), Some("claude"));

        let found = agents.get("/p", "worker-1").await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn reregistration_keeps_first_registration_time() {
        let agents = service().await;
        let first = agents.register("/p", "w", None, None, None).await.unwrap();
        let second = agents.register("/p", "w", None, None, None).await.unwrap();
        assert_eq!(first.registered_at, second.registered_at);
        assert!(second.last_active_at >= first.last_active_at);
    }

    #[tokio::test]
    async fn empty_name_is_invalid() {
        let agents = service().await;
        assert!(matches!(
            agents.register("/p", "  ", None, None, None).await,
            Err(CoreError::Invalid(_))
        ));
    }
}
