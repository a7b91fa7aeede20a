//! Registered devices: the registry's unit of identity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::IpAddr;
use uuid::Uuid;

use super::observation::{same_manufacturer, MacAddress, Observation};

/// A device known to the registry
///
/// (manufacturer, serial_number) is unique when a serial is present and
/// mac_address is unique when present; the registry enforces both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredDevice {
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
    pub metadata: Map<String, Value>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl RegisteredDevice {
    /// Materialize a new device from an observation (NEW outcome or approved review)
    pub fn from_observation(observation: &Observation) -> Self {
        Self {
            id: Uuid::new_v4(),
            manufacturer: observation.manufacturer.clone(),
            serial_number: observation.serial_number.clone(),
            mac_address: observation.mac_address.clone(),
            ip: observation.ip,
            api_device_id: observation.api_device_id.clone(),
            subnet_mask: observation.subnet_mask.clone(),
            gateway: observation.gateway.clone(),
            model: observation.model.clone(),
            firmware_version: observation.firmware_version.clone(),
            device_type: observation.device_type.clone(),
            metadata: observation.metadata.clone(),
            first_seen: observation.observed_at,
            last_seen: observation.observed_at,
        }
    }

    /// DUPLICATE refresh: descriptive metadata and last_seen only
    ///
    /// Identity fields and the ip are never touched here; fields the
    /// observation does not report keep their registered value.
    pub fn refresh_from(&mut self, observation: &Observation) {
        if observation.subnet_mask.is_some() {
            self.subnet_mask = observation.subnet_mask.clone();
        }
        if observation.gateway.is_some() {
            self.gateway = observation.gateway.clone();
        }
        if observation.model.is_some() {
            self.model = observation.model.clone();
        }
        if observation.firmware_version.is_some() {
            self.firmware_version = observation.firmware_version.clone();
        }
        if observation.device_type.is_some() {
            self.device_type = observation.device_type.clone();
        }
        if !observation.metadata.is_empty() {
            self.metadata = observation.metadata.clone();
        }
        if observation.observed_at > self.last_seen {
            self.last_seen = observation.observed_at;
        }
    }

    /// MOVED update: new ip plus the DUPLICATE refresh
    pub fn relocate(&mut self, new_ip: IpAddr, observation: &Observation) {
        self.ip = Some(new_ip);
        self.refresh_from(observation);
    }

    /// Reviewer-approved merge: the observation's manufacturer and identity fields win
    ///
    /// The ip is left to the caller, which records the movement when it changes.
    pub fn apply_reviewed(&mut self, observation: &Observation) {
        self.manufacturer = observation.manufacturer.clone();
        if observation.serial_number.is_some() {
            self.serial_number = observation.serial_number.clone();
        }
        if observation.mac_address.is_some() {
            self.mac_address = observation.mac_address.clone();
        }
        if observation.api_device_id.is_some() {
            self.api_device_id = observation.api_device_id.clone();
        }
        self.refresh_from(observation);
    }

    pub fn is_manufacturer(&self, manufacturer: &str) -> bool {
        same_manufacturer(&self.manufacturer, manufacturer)
    }
}
