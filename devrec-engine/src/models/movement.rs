//! Movement log records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// One auto-applied change of a device's address
///
/// Append-only: only the acknowledgment fields ever change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementRecord {
    pub id: Uuid,
    pub device_id: Uuid,
    pub manufacturer: String,
    /// `None` when the device had no address before
    pub old_ip: Option<IpAddr>,
    pub new_ip: IpAddr,
    pub detected_by: String,
    pub reason: String,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

/// Filter for listing movements; `None` fields do not constrain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementFilter {
    pub manufacturer: Option<String>,
    pub device_id: Option<Uuid>,
}
