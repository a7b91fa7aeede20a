//! Observation normalizer
//!
//! Turns one raw manufacturer payload (a JSON object) into a validated
//! [`Observation`]. Manufacturer APIs disagree on field names and on how
//! they spell "unknown", so every field is looked up under its known aliases
//! and placeholder values are treated as absent.
//!
//! The cycle's manufacturer is authoritative; a `manufacturer` key inside
//! the payload is kept in the raw metadata and otherwise ignored.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::net::IpAddr;

use crate::error::{ReconError, ReconResult};
use crate::models::{MacAddress, Observation};

const SERIAL_KEYS: &[&str] = &["serial_number", "serialNumber", "serial", "sn"];
const MAC_KEYS: &[&str] = &["mac_address", "macAddress", "mac"];
const IP_KEYS: &[&str] = &["ip", "ip_address", "ipAddress", "address"];
const API_ID_KEYS: &[&str] = &["api_device_id", "apiDeviceId", "device_id", "deviceId", "id"];
const SUBNET_KEYS: &[&str] = &["subnet_mask", "subnetMask", "netmask"];
const GATEWAY_KEYS: &[&str] = &["gateway"];
const MODEL_KEYS: &[&str] = &["model", "model_name"];
const FIRMWARE_KEYS: &[&str] = &["firmware_version", "firmwareVersion", "firmware"];
const DEVICE_TYPE_KEYS: &[&str] = &["device_type", "deviceType", "type"];
const OBSERVED_AT_KEYS: &[&str] = &["observed_at", "observedAt"];

/// Values manufacturer APIs report in place of a missing field
const PLACEHOLDERS: &[&str] = &["unknown", "n/a", "none", "null", "-"];

/// Normalize one raw payload reported during `manufacturer`'s poll cycle
///
/// Fails with `ReconError::Validation` when the payload is not an object
/// or yields none of serial number, MAC address, IP address or API id.
pub fn normalize(manufacturer: &str, payload: &Value) -> ReconResult<Observation> {
    let manufacturer = manufacturer.trim();
    if manufacturer.is_empty() {
        return Err(ReconError::Validation(
            "observation has no manufacturer".to_string(),
        ));
    }

    let fields = payload.as_object().ok_or_else(|| {
        ReconError::Validation(format!(
            "{} payload is not a JSON object: {}",
            manufacturer,
            truncate(&payload.to_string(), 80)
        ))
    })?;

    let mut observation = Observation::new(manufacturer);
    observation.serial_number = text_field(fields, SERIAL_KEYS);
    observation.mac_address = mac_field(manufacturer, fields);
    observation.ip = ip_field(manufacturer, fields);
    observation.api_device_id = text_field(fields, API_ID_KEYS);
    observation.subnet_mask = text_field(fields, SUBNET_KEYS);
    observation.gateway = text_field(fields, GATEWAY_KEYS);
    observation.model = text_field(fields, MODEL_KEYS);
    observation.firmware_version = text_field(fields, FIRMWARE_KEYS);
    observation.device_type = text_field(fields, DEVICE_TYPE_KEYS);
    observation.metadata = fields.clone();
    if let Some(observed_at) = timestamp_field(fields) {
        observation.observed_at = observed_at;
    }

    if !observation.has_identity() {
        return Err(ReconError::Validation(format!(
            "{} observation has no serial number, MAC address, IP address or API device id",
            manufacturer
        )));
    }

    Ok(observation)
}

/// First alias holding a usable value, rendered as a trimmed string
fn text_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| fields.get(*key))
        .find_map(scalar_text)
}

fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };

    if text.is_empty() || is_placeholder(&text) {
        None
    } else {
        Some(text)
    }
}

fn is_placeholder(text: &str) -> bool {
    PLACEHOLDERS.iter().any(|p| text.eq_ignore_ascii_case(p))
}

fn mac_field(manufacturer: &str, fields: &Map<String, Value>) -> Option<MacAddress> {
    let raw = text_field(fields, MAC_KEYS)?;
    let mac = MacAddress::parse(&raw);
    if mac.is_none() {
        tracing::warn!(manufacturer, raw = %raw, "Dropping unusable MAC address");
    }
    mac
}

fn ip_field(manufacturer: &str, fields: &Map<String, Value>) -> Option<IpAddr> {
    let raw = text_field(fields, IP_KEYS)?;
    // Some APIs report the interface address in CIDR form
    let host = raw.split('/').next().unwrap_or(&raw).trim();

    match host.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => None,
        Ok(ip) => Some(ip),
        Err(_) => {
            tracing::warn!(manufacturer, raw = %raw, "Dropping unparseable IP address");
            None
        }
    }
}

fn timestamp_field(fields: &Map<String, Value>) -> Option<DateTime<Utc>> {
    let raw = text_field(fields, OBSERVED_AT_KEYS)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
