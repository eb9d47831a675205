//! Domain errors for the hivemind coordination substrate.

use thiserror::Error;

/// Errors surfaced by the store primitives. All variants are values the
/// caller can match on; the layer nearest the user decides between retry,
/// fallback, or surfacing.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("reservation conflict with agent '{with_agent}' on '{with_path}'")]
    ReservationConflict { with_agent: String, with_path: String },

    #[error("dependency cycle detected involving cell: {0}")]
    CycleDetected(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("id fragment '{fragment}' is ambiguous ({count} matches)")]
    Ambiguous { fragment: String, count: usize },

    #[error("external service unavailable: {0}")]
    Unavailable(String),

    #[error("deferred already resolved: {0}")]
    AlreadyResolved(String),

    #[error("expired: {0}")]
    Expired(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound { entity, key: key.into() }
    }

    /// Stable tag used in HTTP error bodies and CLI diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::ReservationConflict { .. } | Self::CycleDetected(_) | Self::Conflict(_) => "conflict",
            Self::Invalid(_) => "invalid",
            Self::Ambiguous { .. } => "ambiguous",
            Self::Unavailable(_) => "unavailable",
            Self::AlreadyResolved(_) => "already_resolved",
            Self::Expired(_) => "expired",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CoreError::not_found("row", "query returned no rows"),
            other => CoreError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(format!("serialization: {err}"))
    }
}
