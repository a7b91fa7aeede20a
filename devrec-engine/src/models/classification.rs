//! Resolver and classifier result types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use super::device::RegisteredDevice;

/// Identity-matching strategies, strongest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPriority {
    /// (manufacturer, serial_number)
    Serial = 1,
    /// mac_address, across manufacturers
    Mac = 2,
    /// ip, across manufacturers
    Ip = 3,
    /// (manufacturer, api_device_id)
    ApiId = 4,
}

impl MatchPriority {
    /// The cascade order
    pub const CASCADE: [MatchPriority; 4] = [
        MatchPriority::Serial,
        MatchPriority::Mac,
        MatchPriority::Ip,
        MatchPriority::ApiId,
    ];

    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MatchPriority::Serial => "serial",
            MatchPriority::Mac => "mac",
            MatchPriority::Ip => "ip",
            MatchPriority::ApiId => "api_id",
        }
    }
}

impl fmt::Display for MatchPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the identity resolver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub device: Option<RegisteredDevice>,
    pub matched_priority: Option<MatchPriority>,
    pub is_new: bool,
}

impl MatchResult {
    pub fn no_match() -> Self {
        Self {
            device: None,
            matched_priority: None,
            is_new: true,
        }
    }

    pub fn matched(device: RegisteredDevice, priority: MatchPriority) -> Self {
        Self {
            device: Some(device),
            matched_priority: Some(priority),
            is_new: false,
        }
    }
}

/// The closed set of classifier outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationKind {
    New,
    Duplicate,
    Moved,
    IpConflict,
    ManufacturerMismatch,
    /// Matched only by api id while another populated field disagrees
    Ambiguous,
}

impl ClassificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ClassificationKind::New => "new",
            ClassificationKind::Duplicate => "duplicate",
            ClassificationKind::Moved => "moved",
            ClassificationKind::IpConflict => "ip_conflict",
            ClassificationKind::ManufacturerMismatch => "manufacturer_mismatch",
            ClassificationKind::Ambiguous => "ambiguous",
        }
    }

    /// Outcomes that go to the discovery queue instead of the registry
    pub fn requires_review(self) -> bool {
        matches!(
            self,
            ClassificationKind::IpConflict
                | ClassificationKind::ManufacturerMismatch
                | ClassificationKind::Ambiguous
        )
    }
}

impl fmt::Display for ClassificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ClassificationKind::New),
            "duplicate" => Ok(ClassificationKind::Duplicate),
            "moved" => Ok(ClassificationKind::Moved),
            "ip_conflict" => Ok(ClassificationKind::IpConflict),
            "manufacturer_mismatch" => Ok(ClassificationKind::ManufacturerMismatch),
            "ambiguous" => Ok(ClassificationKind::Ambiguous),
            other => Err(format!("unknown classification '{}'", other)),
        }
    }
}

/// Conflict flags carried by a queue entry; both may be set at once
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictFlags {
    pub is_ip_conflict: bool,
    pub is_manufacturer_mismatch: bool,
}

/// Everything the discovery queue needs to stage an observation for review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub kind: ClassificationKind,
    pub flags: ConflictFlags,
    pub matched_priority: Option<MatchPriority>,
    pub existing_device: Option<RegisteredDevice>,
    /// Reviewer-facing explanation, e.g. "different device using same IP address"
    pub reason: String,
}

/// Classifier decision for one observation
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Unknown device: create it
    New,
    /// Known device, nothing but metadata changed
    Duplicate {
        device: RegisteredDevice,
        matched_priority: MatchPriority,
    },
    /// Known device at a new address: update ip and log the movement
    Moved {
        device: RegisteredDevice,
        matched_priority: MatchPriority,
        old_ip: Option<IpAddr>,
        new_ip: IpAddr,
    },
    /// Needs a human decision
    Review(ReviewRequest),
}

impl Classification {
    pub fn kind(&self) -> ClassificationKind {
        match self {
            Classification::New => ClassificationKind::New,
            Classification::Duplicate { .. } => ClassificationKind::Duplicate,
            Classification::Moved { .. } => ClassificationKind::Moved,
            Classification::Review(review) => review.kind,
        }
    }
}
