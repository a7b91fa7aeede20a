//! Discovery queue entries and their lifecycle states

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;

use super::classification::{ClassificationKind, ConflictFlags};
use super::observation::{MacAddress, Observation};

/// Queue entry status
///
/// `pending → approved → imported`, `pending → rejected`,
/// `pending → duplicate`. An `approved` entry whose import fails reverts
/// to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Approved,
    Rejected,
    Imported,
    Duplicate,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 5] = [
        QueueStatus::Pending,
        QueueStatus::Approved,
        QueueStatus::Rejected,
        QueueStatus::Imported,
        QueueStatus::Duplicate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Approved => "approved",
            QueueStatus::Rejected => "rejected",
            QueueStatus::Imported => "imported",
            QueueStatus::Duplicate => "duplicate",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueueStatus::Imported | QueueStatus::Rejected | QueueStatus::Duplicate
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "approved" => Ok(QueueStatus::Approved),
            "rejected" => Ok(QueueStatus::Rejected),
            "imported" => Ok(QueueStatus::Imported),
            "duplicate" => Ok(QueueStatus::Duplicate),
            other => Err(format!("unknown queue status '{}'", other)),
        }
    }
}

/// An observation staged for human review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedDevice {
    pub id: Uuid,
    pub manufacturer: String,
    pub serial_number: Option<String>,
    pub mac_address: Option<MacAddress>,
    pub ip: Option<IpAddr>,
    pub api_device_id: Option<String>,
    pub subnet_mask: Option<String>,
    pub gateway: Option<String>,
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    pub device_type: Option<String>,
    pub status: QueueStatus,
    pub classification: ClassificationKind,
    pub reason: String,
    #[serde(flatten)]
    pub flags: ConflictFlags,
    pub existing_device_id: Option<Uuid>,
    pub imported_device_id: Option<Uuid>,
    pub metadata: Map<String, Value>,
    pub observed_at: DateTime<Utc>,
    pub discovered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub sighting_count: i64,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Annotation left by a failed import
    pub last_error: Option<String>,
    /// Bumped on every status change; used for compare-and-swap
    pub revision: i64,
}

impl QueuedDevice {
    /// Rebuild the observation this entry was created from
    pub fn to_observation(&self) -> Observation {
        Observation {
            manufacturer: self.manufacturer.clone(),
            api_device_id: self.api_device_id.clone(),
            serial_number: self.serial_number.clone(),
            mac_address: self.mac_address.clone(),
            ip: self.ip,
            subnet_mask: self.subnet_mask.clone(),
            gateway: self.gateway.clone(),
            model: self.model.clone(),
            firmware_version: self.firmware_version.clone(),
            device_type: self.device_type.clone(),
            metadata: self.metadata.clone(),
            observed_at: self.observed_at,
        }
    }
}

/// Filter for listing pending entries; `None` fields do not constrain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueFilter {
    pub manufacturer: Option<String>,
    pub ip_conflict: Option<bool>,
    pub manufacturer_mismatch: Option<bool>,
}

/// Number of entries per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub approved: i64,
    pub rejected: i64,
    pub imported: i64,
    pub duplicate: i64,
}
