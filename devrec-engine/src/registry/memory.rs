//! In-memory registry for tests and embedded use

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::DeviceRegistry;
use crate::error::{ReconError, ReconResult};
use crate::models::{same_manufacturer, MacAddress, RegisteredDevice};

/// Registry held in a `RwLock<HashMap>`; `upsert` checks uniqueness and
/// writes under one write lock, which makes it atomic.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    devices: RwLock<HashMap<Uuid, RegisteredDevice>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with `devices` (uniqueness is not re-checked)
    pub fn with_devices(devices: impl IntoIterator<Item = RegisteredDevice>) -> Self {
        Self {
            devices: RwLock::new(devices.into_iter().map(|d| (d.id, d)).collect()),
        }
    }

    /// Copy of every registered device, oldest first
    pub async fn all(&self) -> Vec<RegisteredDevice> {
        let devices = self.devices.read().await;
        let mut all: Vec<RegisteredDevice> = devices.values().cloned().collect();
        all.sort_by_key(|d| (d.first_seen, d.id));
        all
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }
}

/// Name the uniqueness rule `device` would break against `other`, if any
fn uniqueness_violation(device: &RegisteredDevice, other: &RegisteredDevice) -> Option<String> {
    if let (Some(serial), Some(other_serial)) = (&device.serial_number, &other.serial_number) {
        if serial == other_serial && same_manufacturer(&device.manufacturer, &other.manufacturer) {
            return Some(format!(
                "device {} already registered with manufacturer '{}' and serial '{}'",
                other.id, other.manufacturer, serial
            ));
        }
    }
    if let (Some(mac), Some(other_mac)) = (&device.mac_address, &other.mac_address) {
        if mac == other_mac {
            return Some(format!(
                "device {} already registered with mac address {}",
                other.id, mac
            ));
        }
    }
    None
}

#[async_trait]
impl DeviceRegistry for InMemoryRegistry {
    async fn find_by_serial(
        &self,
        manufacturer: &str,
        serial: &str,
    ) -> ReconResult<Option<RegisteredDevice>> {
        let devices = self.devices.read().await;
        let mut candidates: Vec<&RegisteredDevice> = devices
            .values()
            .filter(|d| d.serial_number.as_deref() == Some(serial))
            .collect();
        candidates.sort_by_key(|d| (!d.is_manufacturer(manufacturer), d.first_seen, d.id));
        Ok(candidates.first().map(|d| (*d).clone()))
    }

    async fn find_by_mac(&self, mac: &MacAddress) -> ReconResult<Option<RegisteredDevice>> {
        let devices = self.devices.read().await;
        Ok(devices
            .values()
            .find(|d| d.mac_address.as_ref() == Some(mac))
            .cloned())
    }

    async fn find_by_ip(&self, ip: IpAddr) -> ReconResult<Option<RegisteredDevice>> {
        let devices = self.devices.read().await;
        Ok(devices
            .values()
            .filter(|d| d.ip == Some(ip))
            .max_by_key(|d| (d.last_seen, d.id))
            .cloned())
    }

    async fn find_by_api_id(
        &self,
        manufacturer: &str,
        api_id: &str,
    ) -> ReconResult<Option<RegisteredDevice>> {
        let devices = self.devices.read().await;
        Ok(devices
            .values()
            .filter(|d| d.api_device_id.as_deref() == Some(api_id) && d.is_manufacturer(manufacturer))
            .max_by_key(|d| (d.last_seen, d.id))
            .cloned())
    }

    async fn upsert(&self, device: &RegisteredDevice) -> ReconResult<RegisteredDevice> {
        let mut devices = self.devices.write().await;

        if let Some(reason) = devices
            .values()
            .filter(|other| other.id != device.id)
            .find_map(|other| uniqueness_violation(device, other))
        {
            return Err(ReconError::UpsertConflict(reason));
        }

        devices.insert(device.id, device.clone());
        Ok(device.clone())
    }

    async fn refresh(&self, device: &RegisteredDevice) -> ReconResult<RegisteredDevice> {
        let mut devices = self.devices.write().await;
        let stored = devices
            .get_mut(&device.id)
            .ok_or_else(|| ReconError::NotFound(format!("device {}", device.id)))?;

        stored.subnet_mask = device.subnet_mask.clone();
        stored.gateway = device.gateway.clone();
        stored.model = device.model.clone();
        stored.firmware_version = device.firmware_version.clone();
        stored.device_type = device.device_type.clone();
        stored.metadata = device.metadata.clone();
        stored.last_seen = stored.last_seen.max(device.last_seen);

        Ok(stored.clone())
    }

    async fn get(&self, id: Uuid) -> ReconResult<Option<RegisteredDevice>> {
        Ok(self.devices.read().await.get(&id).cloned())
    }
}
