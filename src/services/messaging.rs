//! Inter-agent inbox and threads, built on the event log.

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::adapters::sqlite::{parse_datetime, parse_optional_datetime};
use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::event::{types, MessageReceipt, MessageSent, NewEvent};
use crate::domain::models::{Importance, Message, MessageRecipient, NewMessage};
use crate::services::event_store::EventService;

/// One inbox row: the message plus this recipient's delivery state.
#[derive(Debug, Clone)]
pub struct InboxEntry {
    pub message: Message,
    pub receipt: MessageRecipient,
}

#[derive(Clone)]
pub struct MessageService {
    events: EventService,
}

impl MessageService {
    pub fn new(events: EventService) -> Self {
        Self { events }
    }

    fn pool(&self) -> &SqlitePool {
        self.events.pool()
    }

    /// Send a message to one or more recipients. A message starting a new
    /// thread carries its own id as `thread_id`.
    pub async fn send(&self, project_key: &str, message: NewMessage) -> CoreResult<Message> {
        let mut recipients: Vec<String> = Vec::new();
        for recipient in &message.to_agents {
            let trimmed = recipient.trim();
            if !trimmed.is_empty() && !recipients.iter().any(|r| r == trimmed) {
                recipients.push(trimmed.to_string());
            }
        }
        if recipients.is_empty() {
            return Err(CoreError::Invalid(
                "message needs at least one recipient".to_string(),
            ));
        }

        let message_id = format!("msg-{}", Uuid::new_v4());
        let thread_id = message.thread_id.clone().unwrap_or_else(|| message_id.clone());

        let payload = MessageSent {
            message_id: message_id.clone(),
            from_agent: message.from_agent.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
            thread_id: Some(thread_id),
            importance: message.importance.as_str().to_string(),
            ack_required: message.ack_required,
            recipients,
        };
        self.events
            .append(NewEvent::new(
                types::MESSAGE_SENT,
                project_key,
                serde_json::to_value(&payload)?,
            ))
            .await?;

        self.get(project_key, &message_id)
            .await?
            .ok_or_else(|| CoreError::Internal(format!("message row missing after send: {message_id}")))
    }

    pub async fn get(&self, project_key: &str, message_id: &str) -> CoreResult<Option<Message>> {
        let row: Option<MessageRow> = sqlx::query_as(
            "SELECT id, project_key, from_agent, subject, body, thread_id, importance, ack_required, created_at \
             FROM messages WHERE project_key = ? AND id = ?",
        )
        .bind(project_key)
        .bind(message_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Messages addressed to `agent`, newest first.
    pub async fn inbox(
        &self,
        project_key: &str,
        agent: &str,
        unread_only: bool,
        limit: u32,
    ) -> CoreResult<Vec<InboxEntry>> {
        let mut sql = String::from(
            "SELECT m.id, m.project_key, m.from_agent, m.subject, m.body, m.thread_id, \
                    m.importance, m.ack_required, m.created_at, r.read_at, r.acked_at \
             FROM messages m \
             JOIN message_recipients r ON r.message_id = m.id \
             WHERE m.project_key = ? AND r.agent_name = ?",
        );
        if unread_only {
            sql.push_str(" AND r.read_at IS NULL");
        }
        sql.push_str(" ORDER BY m.created_at DESC, m.id DESC LIMIT ?");

        let rows: Vec<InboxRow> = sqlx::query_as(&sql)
            .bind(project_key)
            .bind(agent)
            .bind(i64::from(limit))
            .fetch_all(self.pool())
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(InboxEntry {
                    receipt: MessageRecipient {
                        message_id: row.message.id.clone(),
                        agent_name: agent.to_string(),
                        read_at: parse_optional_datetime(row.read_at)?,
                        acked_at: parse_optional_datetime(row.acked_at)?,
                    },
                    message: row.message.try_into()?,
                })
            })
            .collect()
    }

    /// All messages in a thread, oldest first.
    pub async fn thread(&self, project_key: &str, thread_id: &str) -> CoreResult<Vec<Message>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, project_key, from_agent, subject, body, thread_id, importance, ack_required, created_at \
             FROM messages WHERE project_key = ? AND (thread_id = ? OR id = ?) \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(project_key)
        .bind(thread_id)
        .bind(thread_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn mark_read(&self, project_key: &str, message_id: &str, agent: &str) -> CoreResult<()> {
        self.receipt_event(project_key, message_id, agent, types::MESSAGE_READ).await
    }

    pub async fn acknowledge(&self, project_key: &str, message_id: &str, agent: &str) -> CoreResult<()> {
        self.receipt_event(project_key, message_id, agent, types::MESSAGE_ACKED).await
    }

    async fn receipt_event(
        &self,
        project_key: &str,
        message_id: &str,
        agent: &str,
        event_type: &str,
    ) -> CoreResult<()> {
        let exists: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM message_recipients WHERE message_id = ? AND agent_name = ?",
        )
        .bind(message_id)
        .bind(agent)
        .fetch_optional(self.pool())
        .await?;
        if exists.is_none() {
            return Err(CoreError::not_found("message recipient", format!("{message_id}/{agent}")));
        }

        let payload = MessageReceipt {
            message_id: message_id.to_string(),
            agent_name: agent.to_string(),
        };
        self.events
            .append(NewEvent::new(event_type, project_key, serde_json::to_value(&payload)?))
            .await?;
        Ok(())
    }

    pub async fn recipients(&self, message_id: &str) -> CoreResult<Vec<MessageRecipient>> {
        let rows: Vec<(String, String, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT message_id, agent_name, read_at, acked_at FROM message_recipients \
             WHERE message_id = ? ORDER BY agent_name",
        )
        .bind(message_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|(message_id, agent_name, read_at, acked_at)| {
                Ok(MessageRecipient {
                    message_id,
                    agent_name,
                    read_at: parse_optional_datetime(read_at)?,
                    acked_at: parse_optional_datetime(acked_at)?,
                })
            })
            .collect()
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    project_key: String,
    from_agent: String,
    subject: String,
    body: String,
    thread_id: Option<String>,
    importance: String,
    ack_required: i64,
    created_at: String,
}

#[derive(sqlx::FromRow)]
struct InboxRow {
    #[sqlx(flatten)]
    message: MessageRow,
    read_at: Option<String>,
    acked_at: Option<String>,
}

impl TryFrom<MessageRow> for Message {
    type Error = CoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            id: row.id,
            project_key: row.project_key,
            from_agent: row.from_agent,
            subject: row.subject,
            body: row.body,
            thread_id: row.thread_id,
            importance: Importance::from_str(&row.importance).unwrap_or(Importance::Normal),
            ack_required: row.ack_required != 0,
            created_at: parse_datetime(&row.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    async fn service() -> MessageService {
        let pool = create_migrated_test_pool().await.unwrap();
        MessageService::new(EventService::new(pool))
    }

    fn note(from: &str, to: &[&str], subject: &str) -> NewMessage {
        NewMessage {
            from_agent: from.to_string(),
            to_agents: to.iter().map(|s| (*s).to_string()).collect(),
            subject: subject.to_string(),
            body: "body".to_string(),
            thread_id: None,
            importance: Importance::Normal,
            ack_required: false,
        }
    }

    #[tokio::test]
    async fn send_requires_a_recipient() {
        let messages = service().await;
        let result = messages.send("/p", note("a", &[], "hi")).await;
        assert!(matches!(result, Err(CoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn first_message_carries_its_own_id_as_thread() {
        let messages = service().await;
        let sent = messages.send("/p", note("a", &["b"], "hi")).await.unwrap();
        assert_eq!(sent.thread_id.as_deref(), Some(sent.id.as_str()));
    }

    #[tokio::test]
    async fn duplicate_recipients_collapse_to_one_row() {
        let messages = service().await;
        let sent = messages.send("/p", note("a", &["b", "b", " b "], "hi")).await.unwrap();
        let recipients = messages.recipients(&sent.id).await.unwrap();
        assert_eq!(recipients.len(), 1);
    }

    #[tokio::test]
    async fn read_then_ack_sets_both_timestamps_once() {
        let messages = service().await;
        let sent = messages.send("/p", note("a", &["b"], "hi")).await.unwrap();

        messages.mark_read("/p", &sent.id, "b").await.unwrap();
        let first = messages.recipients(&sent.id).await.unwrap()[0].read_at;
        assert!(first.is_some());

        // Re-reading never moves the timestamp.
        messages.mark_read("/p", &sent.id, "b").await.unwrap();
        let second = messages.recipients(&sent.id).await.unwrap()[0].read_at;
        assert_eq!(first, second);

        messages.acknowledge("/p", &sent.id, "b").await.unwrap();
        assert!(messages.recipients(&sent.id).await.unwrap()[0].acked_at.is_some());
    }

    #[tokio::test]
    async fn inbox_filters_unread() {
        let messages = service().await;
        let first = messages.send("/p", note("a", &["b"], "one")).await.unwrap();
        messages.send("/p", note("a", &["b"], "two")).await.unwrap();

        messages.mark_read("/p", &first.id, "b").await.unwrap();
        let unread = messages.inbox("/p", "b", true, 10).await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].message.subject, "two");
    }

    #[tokio::test]
    async fn receipt_for_non_recipient_is_not_found() {
        let messages = service().await;
        let sent = messages.send("/p", note("a", &["b"], "hi")).await.unwrap();
        let result = messages.mark_read("/p", &sent.id, "c").await;
        assert!(matches!(result, Err(CoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn thread_collects_replies_in_order() {
        let messages = service().await;
        let root = messages.send("/p", note("a", &["b"], "root")).await.unwrap();

        let mut reply = note("b", &["a"], "reply");
        reply.thread_id = root.thread_id.clone();
        messages.send("/p", reply).await.unwrap();

        let thread = messages.thread("/p", root.thread_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0].subject, "root");
        assert_eq!(thread[1].subject, "reply");
    }
}
