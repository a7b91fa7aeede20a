//! SQLite persistence for the discovery queue and the movement log
//!
//! The registry has its own store behind the `DeviceRegistry` trait; these
//! modules only touch `discovery_queue` and `device_movements`.

pub mod movements;
pub mod queue;

use chrono::{DateTime, Utc};
use devrec_common::time::parse_db_string;
use uuid::Uuid;

use crate::error::{ReconError, ReconResult};

fn corrupt(column: &str, raw: &str, err: impl std::fmt::Display) -> ReconError {
    ReconError::Common(devrec_common::Error::Internal(format!(
        "invalid {} '{}' in database: {}",
        column, raw, err
    )))
}

/// Parse a required text column into `T`
pub(crate) fn parse_value<T>(raw: &str, column: &str) -> ReconResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| corrupt(column, raw, e))
}

/// Parse an optional text column into `T`
pub(crate) fn parse_column<T>(value: Option<String>, column: &str) -> ReconResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|raw| parse_value(&raw, column))
        .transpose()
}

pub(crate) fn parse_timestamp(raw: &str, column: &str) -> ReconResult<DateTime<Utc>> {
    parse_db_string(raw).map_err(|e| corrupt(column, raw, e))
}

pub(crate) fn parse_optional_timestamp(
    raw: Option<String>,
    column: &str,
) -> ReconResult<Option<DateTime<Utc>>> {
    raw.map(|raw| parse_timestamp(&raw, column)).transpose()
}

pub(crate) fn parse_uuid(raw: &str, column: &str) -> ReconResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| corrupt(column, raw, e))
}

pub(crate) fn parse_optional_uuid(raw: Option<String>, column: &str) -> ReconResult<Option<Uuid>> {
    raw.map(|raw| parse_uuid(&raw, column)).transpose()
}
