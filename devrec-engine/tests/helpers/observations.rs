//! Observation and device builders

use std::net::IpAddr;

use devrec_engine::models::{MacAddress, Observation, RegisteredDevice};
use devrec_engine::DeviceRegistry;

pub fn ip(raw: &str) -> IpAddr {
    raw.parse().expect("test ip")
}

pub fn mac(raw: &str) -> MacAddress {
    MacAddress::parse(raw).expect("test mac")
}

/// Insert a device built from `observation` straight into `registry`
pub async fn registered(registry: &dyn DeviceRegistry, observation: Observation) -> RegisteredDevice {
    registry
        .upsert(&RegisteredDevice::from_observation(&observation))
        .await
        .expect("seed device")
}
