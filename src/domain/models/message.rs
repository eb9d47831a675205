//! Inter-agent messages and recipients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    Normal,
    High,
    Urgent,
}

impl Importance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

impl std::fmt::Display for Importance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub project_key: String,
    pub from_agent: String,
    pub subject: String,
    pub body: String,
    pub thread_id: Option<String>,
    pub importance: Importance,
    pub ack_required: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-recipient delivery state. `read_at` / `acked_at` advance
/// monotonically and are never cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecipient {
    pub message_id: String,
    pub agent_name: String,
    pub read_at: Option<DateTime<Utc>>,
    pub acked_at: Option<DateTime<Utc>>,
}

/// Outbound message; every message needs at least one recipient.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub from_agent: String,
    pub to_agents: Vec<String>,
    pub subject: String,
    pub body: String,
    pub thread_id: Option<String>,
    pub importance: Importance,
    pub ack_required: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn importance_round_trips() {
        for s in ["low", "normal", "high", "urgent"] {
            assert_eq!(Importance::from_str(s).unwrap().as_str(), s);
        }
        assert!(Importance::from_str("critical").is_none());
    }
}
