//! Conflict classifier
//!
//! Maps (observation, match) onto exactly one outcome:
//!
//! | match      | condition                                   | outcome                 |
//! |------------|---------------------------------------------|-------------------------|
//! | none       |                                             | New                     |
//! | serial/mac | manufacturer differs                        | ManufacturerMismatch    |
//! | serial/mac | reported ip differs, or device has none     | Moved                   |
//! | serial/mac | ip equal or not reported                    | Duplicate               |
//! | ip         | serial or mac disagrees                     | IpConflict (+ mismatch) |
//! | ip         | manufacturer differs                        | ManufacturerMismatch    |
//! | ip         | otherwise                                   | Duplicate               |
//! | api id     | serial, mac or ip disagrees                 | Ambiguous               |
//! | api id     | otherwise                                   | Duplicate               |
//!
//! A `MatchResult` that contradicts itself is a classification error, never
//! a guessed outcome.

use crate::error::{ReconError, ReconResult};
use crate::models::{
    same_manufacturer, Classification, ClassificationKind, ConflictFlags, MatchPriority,
    MatchResult, Observation, RegisteredDevice, ReviewRequest,
};

/// Reason shown to reviewers for ip conflicts
pub const IP_CONFLICT_REASON: &str = "different device using same IP address";

pub fn classify(observation: &Observation, result: &MatchResult) -> ReconResult<Classification> {
    let (device, priority) = match (&result.device, result.matched_priority, result.is_new) {
        (None, None, true) => return Ok(Classification::New),
        (Some(device), Some(priority), false) => (device, priority),
        (device, priority, is_new) => {
            return Err(ReconError::Classification(format!(
                "inconsistent match result for {}: device={}, priority={}, is_new={}",
                observation.describe(),
                device
                    .as_ref()
                    .map(|d| d.id.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                priority.map(|p| p.as_str()).unwrap_or("none"),
                is_new
            )))
        }
    };

    check_matched_key(observation, device, priority)?;

    let same_mfr = same_manufacturer(&observation.manufacturer, &device.manufacturer);

    let classification = match priority {
        MatchPriority::Serial | MatchPriority::Mac => {
            if !same_mfr {
                review(
                    ClassificationKind::ManufacturerMismatch,
                    ConflictFlags {
                        is_ip_conflict: false,
                        is_manufacturer_mismatch: true,
                    },
                    priority,
                    device,
                    mismatch_reason(observation, device, priority),
                )
            } else {
                match observation.ip {
                    Some(new_ip) if device.ip != Some(new_ip) => Classification::Moved {
                        device: device.clone(),
                        matched_priority: priority,
                        old_ip: device.ip,
                        new_ip,
                    },
                    _ => Classification::Duplicate {
                        device: device.clone(),
                        matched_priority: priority,
                    },
                }
            }
        }
        MatchPriority::Ip => {
            let identity_disagrees = !disagreeing_fields(observation, device, false).is_empty();
            if identity_disagrees {
                let mut reason = format!(
                    "{}: {} is registered to device {} ({})",
                    IP_CONFLICT_REASON,
                    observation.ip.map(|ip| ip.to_string()).unwrap_or_default(),
                    device.id,
                    describe_device(device)
                );
                if !same_mfr {
                    reason.push_str(&format!(
                        "; manufacturer {} differs from {}",
                        observation.manufacturer, device.manufacturer
                    ));
                }
                review(
                    ClassificationKind::IpConflict,
                    ConflictFlags {
                        is_ip_conflict: true,
                        is_manufacturer_mismatch: !same_mfr,
                    },
                    priority,
                    device,
                    reason,
                )
            } else if !same_mfr {
                review(
                    ClassificationKind::ManufacturerMismatch,
                    ConflictFlags {
                        is_ip_conflict: true,
                        is_manufacturer_mismatch: true,
                    },
                    priority,
                    device,
                    mismatch_reason(observation, device, priority),
                )
            } else {
                Classification::Duplicate {
                    device: device.clone(),
                    matched_priority: priority,
                }
            }
        }
        MatchPriority::ApiId => {
            let mut fields = disagreeing_fields(observation, device, true);
            if !same_mfr {
                fields.insert(0, "manufacturer");
            }
            if fields.is_empty() {
                Classification::Duplicate {
                    device: device.clone(),
                    matched_priority: priority,
                }
            } else {
                review(
                    ClassificationKind::Ambiguous,
                    ConflictFlags::default(),
                    priority,
                    device,
                    format!(
                        "matched device {} only by API device id; disagreeing fields: {}",
                        device.id,
                        fields.join(", ")
                    ),
                )
            }
        }
    };

    Ok(classification)
}

fn review(
    kind: ClassificationKind,
    flags: ConflictFlags,
    priority: MatchPriority,
    device: &RegisteredDevice,
    reason: String,
) -> Classification {
    Classification::Review(ReviewRequest {
        kind,
        flags,
        matched_priority: Some(priority),
        existing_device: Some(device.clone()),
        reason,
    })
}

/// The key a match claims must actually be shared
fn check_matched_key(
    observation: &Observation,
    device: &RegisteredDevice,
    priority: MatchPriority,
) -> ReconResult<()> {
    let shared = match priority {
        MatchPriority::Serial => {
            observation.serial_number.is_some() && observation.serial_number == device.serial_number
        }
        MatchPriority::Mac => {
            observation.mac_address.is_some() && observation.mac_address == device.mac_address
        }
        MatchPriority::Ip => observation.ip.is_some() && observation.ip == device.ip,
        MatchPriority::ApiId => {
            observation.api_device_id.is_some() && observation.api_device_id == device.api_device_id
        }
    };

    if shared {
        Ok(())
    } else {
        Err(ReconError::Classification(format!(
            "match by {} does not share that key: observation {} vs device {}",
            priority,
            observation.describe(),
            device.id
        )))
    }
}

/// Identity fields populated on both sides with different values
fn disagreeing_fields(
    observation: &Observation,
    device: &RegisteredDevice,
    include_ip: bool,
) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if differs(&observation.serial_number, &device.serial_number) {
        fields.push("serial_number");
    }
    if differs(&observation.mac_address, &device.mac_address) {
        fields.push("mac_address");
    }
    if include_ip && differs(&observation.ip, &device.ip) {
        fields.push("ip");
    }
    fields
}

fn differs<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a != b)
}

fn mismatch_reason(
    observation: &Observation,
    device: &RegisteredDevice,
    priority: MatchPriority,
) -> String {
    let key = match priority {
        MatchPriority::Serial => format!(
            "serial number {}",
            observation.serial_number.as_deref().unwrap_or_default()
        ),
        MatchPriority::Mac => format!(
            "MAC address {}",
            observation
                .mac_address
                .as_ref()
                .map(|m| m.to_string())
                .unwrap_or_default()
        ),
        MatchPriority::Ip => format!(
            "IP address {}",
            observation.ip.map(|ip| ip.to_string()).unwrap_or_default()
        ),
        MatchPriority::ApiId => format!(
            "API device id {}",
            observation.api_device_id.as_deref().unwrap_or_default()
        ),
    };

    format!(
        "{} is registered to {} device {}, but was reported by {}",
        key, device.manufacturer, device.id, observation.manufacturer
    )
}

fn describe_device(device: &RegisteredDevice) -> String {
    let mut parts = vec![device.manufacturer.clone()];
    if let Some(serial) = &device.serial_number {
        parts.push(format!("serial={}", serial));
    }
    if let Some(mac) = &device.mac_address {
        parts.push(format!("mac={}", mac));
    }
    parts.join(" ")
}
