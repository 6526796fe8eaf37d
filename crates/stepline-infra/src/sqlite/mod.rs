//! SQLite storage layer.
//!
//! Repository and queue implementations backed by SQLite with WAL mode and
//! split read/write connection pools.

pub mod execution;
pub mod pool;
pub mod queue;
pub mod workflow;

use chrono::{DateTime, SecondsFormat, Utc};
use stepline_types::error::RepositoryError;
use uuid::Uuid;

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 in UTC, so text comparison in SQL orders by time.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a snake_case enum stored as text.
pub(crate) fn parse_enum<T: serde::de::DeserializeOwned>(
    value: &str,
    what: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {value}")))
}

pub(crate) fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}
