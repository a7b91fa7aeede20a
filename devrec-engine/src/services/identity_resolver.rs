//! Identity resolver
//!
//! Runs the fixed priority cascade (serial, mac, ip, api id) against an
//! already-fetched registry snapshot and stops at the first hit. No I/O,
//! no suspension points.

use crate::models::{MatchPriority, MatchResult, Observation, RegisteredDevice};
use crate::registry::RegistryLookup;

/// Resolve `observation` to at most one registered device
pub fn resolve(observation: &Observation, registry: &impl RegistryLookup) -> MatchResult {
    for priority in MatchPriority::CASCADE {
        if let Some(device) = lookup(observation, registry, priority) {
            tracing::trace!(
                device_id = %device.id,
                priority = %priority,
                observation = %observation.describe(),
                "Identity resolved"
            );
            return MatchResult::matched(device.clone(), priority);
        }
    }

    MatchResult::no_match()
}

fn lookup<'r>(
    observation: &Observation,
    registry: &'r impl RegistryLookup,
    priority: MatchPriority,
) -> Option<&'r RegisteredDevice> {
    match priority {
        MatchPriority::Serial => observation
            .serial_number
            .as_deref()
            .and_then(|serial| registry.find_by_serial(&observation.manufacturer, serial)),
        MatchPriority::Mac => observation
            .mac_address
            .as_ref()
            .and_then(|mac| registry.find_by_mac(mac)),
        MatchPriority::Ip => observation.ip.and_then(|ip| registry.find_by_ip(ip)),
        MatchPriority::ApiId => observation
            .api_device_id
            .as_deref()
            .and_then(|api_id| registry.find_by_api_id(&observation.manufacturer, api_id)),
    }
}
