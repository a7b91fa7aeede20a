//! Observations: one manufacturer-reported snapshot of a device

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::net::IpAddr;

/// Canonical MAC address: lowercase, colon separated (`aa:bb:cc:dd:ee:ff`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MacAddress(String);

impl MacAddress {
    /// Parse any common MAC notation (`AA:BB:..`, `aa-bb-..`, `aabb.ccdd.eeff`, bare hex)
    ///
    /// Returns `None` for malformed input and for the all-zero and broadcast
    /// addresses, which manufacturer APIs report when the real value is unknown.
    pub fn parse(raw: &str) -> Option<Self> {
        let hex: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .collect();

        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }

        let hex = hex.to_ascii_lowercase();
        if hex == "000000000000" || hex == "ffffffffffff" {
            return None;
        }

        let octets: Vec<&str> = (0..6).map(|i| &hex[i * 2..i * 2 + 2]).collect();
        Some(Self(octets.join(":")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Case-insensitive manufacturer comparison
pub fn same_manufacturer(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// A validated observation
///
/// At least one of serial, mac, ip or api id is present; the normalizer
/// enforces this before an observation reaches the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub manufacturer: String,
    pub api_device_id: Option<String>,
    pub serial_number: Option<String>,
    pub mac_address: Option<MacAddress>,
    pub ip: Option<IpAddr>,
    pub subnet_mask: Option<String>,
    pub gateway: Option<String>,
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    pub device_type: Option<String>,
    /// The full raw payload as reported by the manufacturer
    pub metadata: Map<String, Value>,
    pub observed_at: DateTime<Utc>,
}

impl Observation {
    /// Empty observation for `manufacturer`; populate with the `with_*` builders
    pub fn new(manufacturer: impl Into<String>) -> Self {
        Self {
            manufacturer: manufacturer.into(),
            api_device_id: None,
            serial_number: None,
            mac_address: None,
            ip: None,
            subnet_mask: None,
            gateway: None,
            model: None,
            firmware_version: None,
            device_type: None,
            metadata: Map::new(),
            observed_at: Utc::now(),
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    pub fn with_mac(mut self, mac: MacAddress) -> Self {
        self.mac_address = Some(mac);
        self
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_api_id(mut self, api_id: impl Into<String>) -> Self {
        self.api_device_id = Some(api_id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_firmware(mut self, firmware: impl Into<String>) -> Self {
        self.firmware_version = Some(firmware.into());
        self
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }

    /// True when at least one identity key is present
    pub fn has_identity(&self) -> bool {
        self.serial_number.is_some()
            || self.mac_address.is_some()
            || self.ip.is_some()
            || self.api_device_id.is_some()
    }

    /// Stable key naming the physical identity this observation claims
    ///
    /// Strongest key wins: serial, then mac, then api id, then ip.
    pub fn identity_key(&self) -> Option<String> {
        let manufacturer = self.manufacturer.trim().to_ascii_lowercase();
        if let Some(serial) = &self.serial_number {
            return Some(format!("serial:{}:{}", manufacturer, serial));
        }
        if let Some(mac) = &self.mac_address {
            return Some(format!("mac:{}", mac));
        }
        if let Some(api_id) = &self.api_device_id {
            return Some(format!("api:{}:{}", manufacturer, api_id));
        }
        self.ip.map(|ip| format!("ip:{}", ip))
    }

    /// Short human-readable identity for log lines
    pub fn describe(&self) -> String {
        let mut parts = vec![self.manufacturer.clone()];
        if let Some(serial) = &self.serial_number {
            parts.push(format!("serial={}", serial));
        }
        if let Some(mac) = &self.mac_address {
            parts.push(format!("mac={}", mac));
        }
        if let Some(ip) = &self.ip {
            parts.push(format!("ip={}", ip));
        }
        if let Some(api_id) = &self.api_device_id {
            parts.push(format!("api_id={}", api_id));
        }
        parts.join(" ")
    }
}
