//! File-scope reservations: acquire with conflict detection, release,
//! and TTL sweeps.

use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::adapters::sqlite::{parse_datetime, parse_optional_datetime};
use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::event::{
    types, NewEvent, ReservationAcquired, ReservationExpired, ReservationReleased, ReservedPattern,
};
use crate::domain::models::{Reservation, ReservationHandle};
use crate::services::event_store::EventService;

#[derive(Clone)]
pub struct ReservationService {
    events: EventService,
}

impl ReservationService {
    pub fn new(events: EventService) -> Self {
        Self { events }
    }

    fn pool(&self) -> &SqlitePool {
        self.events.pool()
    }

    /// Reserve `patterns` for `agent`. The conflict check and the append
    /// run in one transaction so two racing acquires cannot both succeed.
    pub async fn acquire(
        &self,
        project_key: &str,
        agent: &str,
        patterns: &[&str],
        reason: Option<&str>,
        ttl: Duration,
        exclusive: bool,
    ) -> CoreResult<ReservationHandle> {
        let normalized = normalize_patterns(patterns);
        if normalized.is_empty() {
            return Err(CoreError::Invalid("no path patterns supplied".to_string()));
        }
        if ttl <= Duration::zero() {
            return Err(CoreError::Invalid("reservation ttl must be positive".to_string()));
        }

        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let active: Vec<ReservationRow> = sqlx::query_as(
            "SELECT id, project_key, agent_name, path_pattern, exclusive, reason, \
                    created_at, expires_at, released_at, lock_holder_id \
             FROM reservations \
             WHERE project_key = ? AND released_at IS NULL AND expires_at > ?",
        )
        .bind(project_key)
        .bind(crate::adapters::sqlite::format_datetime(now))
        .fetch_all(&mut *tx)
        .await?;

        for row in &active {
            let holder_exclusive = row.exclusive != 0;
            if !holder_exclusive && !exclusive {
                continue;
            }
            for pattern in &normalized {
                if patterns_overlap(&row.path_pattern, pattern) {
                    return Err(CoreError::ReservationConflict {
                        with_agent: row.agent_name.clone(),
                        with_path: row.path_pattern.clone(),
                    });
                }
            }
        }

        let handle_id = format!("rsv-{}", Uuid::new_v4());
        let expires_at = now + ttl;
        let payload = ReservationAcquired {
            handle_id: handle_id.clone(),
            agent_name: agent.to_string(),
            patterns: normalized
                .iter()
                .map(|pattern| ReservedPattern {
                    row_id: format!("rsv-{}", Uuid::new_v4()),
                    pattern: pattern.clone(),
                })
                .collect(),
            exclusive,
            reason: reason.map(str::to_string),
            expires_at,
        };

        let record = self
            .events
            .append_tx(
                &mut tx,
                NewEvent::new(types::RESERVATION_ACQUIRED, project_key, serde_json::to_value(&payload)?),
            )
            .await?;
        tx.commit().await?;
        self.events.publish(&record);

        Ok(ReservationHandle { id: handle_id, expires_at })
    }

    /// Release every row acquired under `handle`. Idempotent: releasing an
    /// already-released handle appends an event the projection ignores.
    pub async fn release(&self, project_key: &str, handle_id: &str) -> CoreResult<()> {
        let payload = ReservationReleased { handle_id: handle_id.to_string() };
        self.events
            .append(NewEvent::new(
                types::RESERVATION_RELEASED,
                project_key,
                serde_json::to_value(&payload)?,
            ))
            .await?;
        Ok(())
    }

    /// Close every active reservation whose TTL has elapsed. Returns the
    /// number of rows expired. Background callers run this periodically.
    pub async fn sweep_expired(&self, project_key: &str) -> CoreResult<u64> {
        let now = crate::adapters::sqlite::format_datetime(Utc::now());
        let expired: Vec<(String, String)> = sqlx::query_as(
            "SELECT id, expires_at FROM reservations \
             WHERE project_key = ? AND released_at IS NULL AND expires_at <= ?",
        )
        .bind(project_key)
        .bind(&now)
        .fetch_all(self.pool())
        .await?;

        let mut count = 0u64;
        for (id, expires_at) in expired {
            let payload = ReservationExpired {
                reservation_id: id,
                expires_at: parse_datetime(&expires_at)?,
            };
            self.events
                .append(NewEvent::new(
                    types::RESERVATION_EXPIRED,
                    project_key,
                    serde_json::to_value(&payload)?,
                ))
                .await?;
            count += 1;
        }
        Ok(count)
    }

    /// Sweep every project with expired active reservations; used by the
    /// background sweeper in the server loop.
    pub async fn sweep_all_expired(&self) -> CoreResult<u64> {
        let now = crate::adapters::sqlite::format_datetime(Utc::now());
        let projects: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT project_key FROM reservations \
             WHERE released_at IS NULL AND expires_at <= ?",
        )
        .bind(&now)
        .fetch_all(self.pool())
        .await?;

        let mut total = 0u64;
        for (project,) in projects {
            total += self.sweep_expired(&project).await?;
        }
        Ok(total)
    }

    pub async fn list_active(&self, project_key: &str) -> CoreResult<Vec<Reservation>> {
        let now = crate::adapters::sqlite::format_datetime(Utc::now());
        let rows: Vec<ReservationRow> = sqlx::query_as(
            "SELECT id, project_key, agent_name, path_pattern, exclusive, reason, \
                    created_at, expires_at, released_at, lock_holder_id \
             FROM reservations \
             WHERE project_key = ? AND released_at IS NULL AND expires_at > ? \
             ORDER BY created_at",
        )
        .bind(project_key)
        .bind(&now)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

/// Trim, drop empties, and deduplicate while keeping caller order.
fn normalize_patterns(patterns: &[&str]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for pattern in patterns {
        let trimmed = pattern.trim();
        if !trimmed.is_empty() && !out.iter().any(|p| p == trimmed) {
            out.push(trimmed.to_string());
        }
    }
    out
}

/// Two patterns overlap if either is a string prefix of the other, or, when
/// globs are involved, their segment-level intersection is non-empty
/// (`*` matches one segment, `**` matches any run of segments).
pub fn patterns_overlap(a: &str, b: &str) -> bool {
    if !a.contains('*') && !b.contains('*') {
        return a.starts_with(b) || b.starts_with(a);
    }
    let a_segments: Vec<&str> = a.split('/').filter(|s| !s.is_empty()).collect();
    let b_segments: Vec<&str> = b.split('/').filter(|s| !s.is_empty()).collect();
    segments_intersect(&a_segments, &b_segments)
}

fn segments_intersect(a: &[&str], b: &[&str]) -> bool {
    match (a.first(), b.first()) {
        (None, None) => true,
        (Some(&"**"), _) => {
            segments_intersect(&a[1..], b) || (!b.is_empty() && segments_intersect(a, &b[1..]))
        }
        (_, Some(&"**")) => {
            segments_intersect(a, &b[1..]) || (!a.is_empty() && segments_intersect(&a[1..], b))
        }
        (None, Some(_)) | (Some(_), None) => false,
        (Some(x), Some(y)) => segment_compatible(x, y) && segments_intersect(&a[1..], &b[1..]),
    }
}

/// Can some concrete segment satisfy both patterns?
fn segment_compatible(a: &str, b: &str) -> bool {
    if a == "*" || b == "*" {
        return true;
    }
    match (a.split_once('*'), b.split_once('*')) {
        (None, None) => a == b,
        (Some((prefix, suffix)), None) => b.starts_with(prefix) && b.ends_with(suffix),
        (None, Some((prefix, suffix))) => a.starts_with(prefix) && a.ends_with(suffix),
        (Some((pa, sa)), Some((pb, sb))) => {
            (pa.starts_with(pb) || pb.starts_with(pa)) && (sa.ends_with(sb) || sb.ends_with(sa))
        }
    }
}

#[derive(sqlx::FromRow)]
struct ReservationRow {
    id: String,
    project_key: String,
    agent_name: String,
    path_pattern: String,
    exclusive: i64,
    reason: Option<String>,
    created_at: String,
    expires_at: String,
    released_at: Option<String>,
    lock_holder_id: Option<String>,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = CoreError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        Ok(Reservation {
            id: row.id,
            project_key: row.project_key,
            agent_name: row.agent_name,
            path_pattern: row.path_pattern,
            exclusive: row.exclusive != 0,
            reason: row.reason,
            created_at: parse_datetime(&row.created_at)?,
            expires_at: parse_datetime(&row.expires_at)?,
            released_at: parse_optional_datetime(row.released_at)?,
            lock_holder_id: row.lock_holder_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_prefix_overlap() {
        assert!(patterns_overlap("src/auth.ts", "src/auth.ts"));
        assert!(patterns_overlap("src", "src/auth.ts"));
        assert!(patterns_overlap("src/auth.ts", "src"));
        assert!(!patterns_overlap("src/auth.ts", "src/other.ts"));
    }

    #[test]
    fn glob_segment_overlap() {
        assert!(patterns_overlap("src/*", "src/auth.ts"));
        assert!(patterns_overlap("src/**", "src/deep/nested/file.ts"));
        assert!(patterns_overlap("src/*.ts", "src/auth.ts"));
        assert!(!patterns_overlap("src/*.ts", "lib/auth.ts"));
        assert!(!patterns_overlap("src/*/auth.ts", "src/auth.ts"));
    }

    #[test]
    fn two_globs_intersect_at_segment_level() {
        assert!(patterns_overlap("src/*/mod.rs", "src/core/*"));
        assert!(patterns_overlap("**/auth.ts", "src/auth.ts"));
        assert!(!patterns_overlap("src/*.rs", "src/*.ts"));
    }

    #[test]
    fn normalize_trims_and_dedupes() {
        let out = normalize_patterns(&[" a ", "a", "", "b"]);
        assert_eq!(out, vec!["a".to_string(), "b".to_string()]);
    }
}
