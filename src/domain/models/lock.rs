//! Distributed mutex rows with fencing tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// At most one unexpired row per resource. `seq` is the fencing token:
/// strictly increasing per resource, never reused, advancing even when an
/// expired lock is stolen so late writes from a past holder are rejectable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub resource: String,
    pub holder: String,
    pub seq: i64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
