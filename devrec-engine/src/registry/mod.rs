//! Device registry interfaces
//!
//! The registry is the identity source of truth and is owned by a storage
//! collaborator. The engine sees it through two seams:
//! - [`DeviceRegistry`]: the async store (four lookups plus one atomic upsert)
//! - [`RegistryLookup`]: synchronous lookups over an already-fetched
//!   [`RegistrySnapshot`], which is all the pure resolver ever reads

mod memory;
mod sqlite;

pub use memory::InMemoryRegistry;
pub use sqlite::SqliteRegistry;

use async_trait::async_trait;
use std::net::IpAddr;
use uuid::Uuid;

use crate::error::ReconResult;
use crate::models::{
    same_manufacturer, MacAddress, MovementRecord, Observation, RegisteredDevice,
};

/// Synchronous lookups used by the identity resolver
pub trait RegistryLookup {
    /// Device with this serial, preferring the same manufacturer
    fn find_by_serial(&self, manufacturer: &str, serial: &str) -> Option<&RegisteredDevice>;
    fn find_by_mac(&self, mac: &MacAddress) -> Option<&RegisteredDevice>;
    fn find_by_ip(&self, ip: IpAddr) -> Option<&RegisteredDevice>;
    fn find_by_api_id(&self, manufacturer: &str, api_id: &str) -> Option<&RegisteredDevice>;
}

/// The registry store
///
/// `find_by_serial` returns the device registered under (manufacturer,
/// serial) when one exists, otherwise a device carrying the same serial
/// under a different manufacturer, so that a manufacturer mismatch is
/// visible to the classifier. `find_by_ip` returns the most recently seen
/// holder of the address.
///
/// `upsert` is atomic and keyed by device id: an unknown id is inserted, a
/// known id is updated. A write that would duplicate another device's
/// (manufacturer, serial) or mac fails with `ReconError::UpsertConflict`.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn find_by_serial(
        &self,
        manufacturer: &str,
        serial: &str,
    ) -> ReconResult<Option<RegisteredDevice>>;

    async fn find_by_mac(&self, mac: &MacAddress) -> ReconResult<Option<RegisteredDevice>>;

    async fn find_by_ip(&self, ip: IpAddr) -> ReconResult<Option<RegisteredDevice>>;

    async fn find_by_api_id(
        &self,
        manufacturer: &str,
        api_id: &str,
    ) -> ReconResult<Option<RegisteredDevice>>;

    async fn upsert(&self, device: &RegisteredDevice) -> ReconResult<RegisteredDevice>;

    /// DUPLICATE write for a known device id
    ///
    /// Stores only the descriptive fields, metadata and last_seen (never
    /// moved backwards); identity fields and the ip keep whatever the store
    /// holds now. Returns the stored device.
    async fn refresh(&self, device: &RegisteredDevice) -> ReconResult<RegisteredDevice>;

    /// Upsert a relocated device and append its movement record atomically
    ///
    /// Registries without access to the movement log's storage return
    /// `Ok(None)` without writing; the caller then writes both itself.
    async fn upsert_relocated(
        &self,
        _device: &RegisteredDevice,
        _movement: &MovementRecord,
    ) -> ReconResult<Option<RegisteredDevice>> {
        Ok(None)
    }

    async fn get(&self, id: Uuid) -> ReconResult<Option<RegisteredDevice>>;

    /// Fetch every device the resolver could consult for `observation`
    async fn snapshot_for(&self, observation: &Observation) -> ReconResult<RegistrySnapshot> {
        let mut snapshot = RegistrySnapshot::default();

        if let Some(serial) = &observation.serial_number {
            if let Some(device) = self.find_by_serial(&observation.manufacturer, serial).await? {
                snapshot.insert(device);
            }
        }
        if let Some(mac) = &observation.mac_address {
            if let Some(device) = self.find_by_mac(mac).await? {
                snapshot.insert(device);
            }
        }
        if let Some(ip) = observation.ip {
            if let Some(device) = self.find_by_ip(ip).await? {
                snapshot.insert(device);
            }
        }
        if let Some(api_id) = &observation.api_device_id {
            if let Some(device) = self.find_by_api_id(&observation.manufacturer, api_id).await? {
                snapshot.insert(device);
            }
        }

        Ok(snapshot)
    }
}

/// Point-in-time copy of the registry devices relevant to one observation
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    devices: Vec<RegisteredDevice>,
}

impl RegistrySnapshot {
    pub fn new(devices: Vec<RegisteredDevice>) -> Self {
        let mut snapshot = Self::default();
        for device in devices {
            snapshot.insert(device);
        }
        snapshot
    }

    /// Add a device; a device with the same id replaces the earlier copy
    pub fn insert(&mut self, device: RegisteredDevice) {
        match self.devices.iter_mut().find(|d| d.id == device.id) {
            Some(existing) => *existing = device,
            None => self.devices.push(device),
        }
    }

    pub fn devices(&self) -> &[RegisteredDevice] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl RegistryLookup for RegistrySnapshot {
    fn find_by_serial(&self, manufacturer: &str, serial: &str) -> Option<&RegisteredDevice> {
        let mut with_serial = self
            .devices
            .iter()
            .filter(|d| d.serial_number.as_deref() == Some(serial));
        let first = with_serial.clone().next();
        with_serial
            .find(|d| same_manufacturer(&d.manufacturer, manufacturer))
            .or(first)
    }

    fn find_by_mac(&self, mac: &MacAddress) -> Option<&RegisteredDevice> {
        self.devices
            .iter()
            .find(|d| d.mac_address.as_ref() == Some(mac))
    }

    fn find_by_ip(&self, ip: IpAddr) -> Option<&RegisteredDevice> {
        self.devices
            .iter()
            .filter(|d| d.ip == Some(ip))
            .max_by_key(|d| d.last_seen)
    }

    fn find_by_api_id(&self, manufacturer: &str, api_id: &str) -> Option<&RegisteredDevice> {
        self.devices.iter().find(|d| {
            d.api_device_id.as_deref() == Some(api_id)
                && same_manufacturer(&d.manufacturer, manufacturer)
        })
    }
}
