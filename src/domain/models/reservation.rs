//! File-scope reservations with TTL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A declared intent to modify files matching `path_pattern`. Active while
/// `released_at` is unset and `expires_at` lies in the future.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub project_key: String,
    pub agent_name: String,
    pub path_pattern: String,
    pub exclusive: bool,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    /// Groups the rows acquired by one `acquire` call; release targets it.
    pub lock_holder_id: Option<String>,
}

impl Reservation {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.released_at.is_none() && self.expires_at > now
    }
}

/// Returned by a successful acquire; release takes it back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationHandle {
    pub id: String,
    pub expires_at: DateTime<Utc>,
}
