//! Timestamp utilities

use chrono::{DateTime, SecondsFormat, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Render a timestamp the way it is stored in SQLite text columns
///
/// Fixed-width microsecond RFC 3339 so that lexical order equals time order.
pub fn to_db_string(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp stored by [`to_db_string`] (any RFC 3339 input is accepted)
pub fn parse_db_string(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}
