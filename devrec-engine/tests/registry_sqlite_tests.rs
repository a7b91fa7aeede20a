//! SQLite registry tests

mod helpers;

use chrono::Duration;
use devrec_engine::models::{Observation, RegisteredDevice};
use devrec_engine::{DeviceRegistry, ReconError, SqliteRegistry};
use helpers::{create_test_db, ip, mac};
use serde_json::json;

async fn registry() -> (tempfile::TempDir, SqliteRegistry) {
    let (temp_dir, db) = create_test_db().await.unwrap();
    (temp_dir, SqliteRegistry::new(db))
}

#[tokio::test]
async fn test_upsert_round_trips_every_field() {
    let (_dir, registry) = registry().await;

    let mut obs = Observation::new("Shure")
        .with_serial("S1")
        .with_mac(mac("00:0e:dd:00:00:01"))
        .with_ip(ip("10.0.0.1"))
        .with_api_id("dev-1")
        .with_model("ULXD4")
        .with_firmware("2.4.1");
    obs.subnet_mask = Some("255.255.255.0".to_string());
    obs.gateway = Some("10.0.0.254".to_string());
    obs.device_type = Some("receiver".to_string());
    obs.metadata = json!({"channel_count": 4})
        .as_object()
        .cloned()
        .unwrap();

    let device = registry
        .upsert(&RegisteredDevice::from_observation(&obs))
        .await
        .unwrap();
    let stored = registry.get(device.id).await.unwrap().unwrap();

    assert_eq!(stored.manufacturer, "Shure");
    assert_eq!(stored.serial_number.as_deref(), Some("S1"));
    assert_eq!(stored.mac_address, Some(mac("00:0e:dd:00:00:01")));
    assert_eq!(stored.ip, Some(ip("10.0.0.1")));
    assert_eq!(stored.api_device_id.as_deref(), Some("dev-1"));
    assert_eq!(stored.subnet_mask.as_deref(), Some("255.255.255.0"));
    assert_eq!(stored.gateway.as_deref(), Some("10.0.0.254"));
    assert_eq!(stored.model.as_deref(), Some("ULXD4"));
    assert_eq!(stored.firmware_version.as_deref(), Some("2.4.1"));
    assert_eq!(stored.device_type.as_deref(), Some("receiver"));
    assert_eq!(stored.metadata.get("channel_count"), Some(&json!(4)));
}

#[tokio::test]
async fn test_upsert_existing_id_updates_in_place() {
    let (_dir, registry) = registry().await;
    let obs = Observation::new("Shure").with_serial("S1").with_ip(ip("10.0.0.1"));
    let device = registry
        .upsert(&RegisteredDevice::from_observation(&obs))
        .await
        .unwrap();
    let first_seen = registry.get(device.id).await.unwrap().unwrap().first_seen;

    let mut changed = device.clone();
    changed.ip = Some(ip("10.0.0.2"));
    changed.firmware_version = Some("3.0".to_string());
    changed.last_seen = device.last_seen + Duration::minutes(5);
    registry.upsert(&changed).await.unwrap();

    let stored = registry.get(device.id).await.unwrap().unwrap();
    assert_eq!(stored.ip, Some(ip("10.0.0.2")));
    assert_eq!(stored.firmware_version.as_deref(), Some("3.0"));
    assert_eq!(stored.first_seen, first_seen);
    assert!(stored.last_seen > first_seen);
    assert_eq!(registry.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_duplicate_identity_is_upsert_conflict() {
    let (_dir, registry) = registry().await;
    registry
        .upsert(&RegisteredDevice::from_observation(
            &Observation::new("Shure")
                .with_serial("S1")
                .with_mac(mac("00:0e:dd:00:00:01")),
        ))
        .await
        .unwrap();

    // Same serial, manufacturer spelled differently
    let same_serial = RegisteredDevice::from_observation(&Observation::new("SHURE").with_serial("S1"));
    assert!(matches!(
        registry.upsert(&same_serial).await,
        Err(ReconError::UpsertConflict(_))
    ));

    let same_mac = RegisteredDevice::from_observation(
        &Observation::new("Sennheiser").with_mac(mac("00:0e:dd:00:00:01")),
    );
    assert!(matches!(
        registry.upsert(&same_mac).await,
        Err(ReconError::UpsertConflict(_))
    ));

    // Serial numbers are only unique within a manufacturer
    let other_vendor = RegisteredDevice::from_observation(&Observation::new("Sennheiser").with_serial("S1"));
    registry.upsert(&other_vendor).await.unwrap();
    assert_eq!(registry.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_serial_lookup_prefers_same_manufacturer() {
    let (_dir, registry) = registry().await;
    let sennheiser = registry
        .upsert(&RegisteredDevice::from_observation(
            &Observation::new("Sennheiser").with_serial("S1"),
        ))
        .await
        .unwrap();
    let shure = registry
        .upsert(&RegisteredDevice::from_observation(
            &Observation::new("Shure").with_serial("S1"),
        ))
        .await
        .unwrap();

    let found = registry.find_by_serial("shure", "S1").await.unwrap().unwrap();
    assert_eq!(found.id, shure.id);

    let found = registry.find_by_serial("Sennheiser", "S1").await.unwrap().unwrap();
    assert_eq!(found.id, sennheiser.id);

    // Falls back to another manufacturer's device
    let found = registry.find_by_serial("Audio-Technica", "S1").await.unwrap();
    assert!(found.is_some());

    assert!(registry.find_by_serial("Shure", "S2").await.unwrap().is_none());
}

#[tokio::test]
async fn test_ip_lookup_returns_most_recently_seen_holder() {
    let (_dir, registry) = registry().await;
    let older = Observation::new("Shure").with_serial("S1").with_ip(ip("10.0.0.1"));
    let newer = Observation::new("Shure")
        .with_serial("S2")
        .with_ip(ip("10.0.0.1"))
        .observed_at(older.observed_at + Duration::seconds(10));

    registry
        .upsert(&RegisteredDevice::from_observation(&newer))
        .await
        .unwrap();
    registry
        .upsert(&RegisteredDevice::from_observation(&older))
        .await
        .unwrap();

    let holder = registry.find_by_ip(ip("10.0.0.1")).await.unwrap().unwrap();
    assert_eq!(holder.serial_number.as_deref(), Some("S2"));
    assert!(registry.find_by_ip(ip("10.0.0.9")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_snapshot_collects_each_candidate_once() {
    let (_dir, registry) = registry().await;
    let device = registry
        .upsert(&RegisteredDevice::from_observation(
            &Observation::new("Shure")
                .with_serial("S1")
                .with_mac(mac("00:0e:dd:00:00:01"))
                .with_ip(ip("10.0.0.1")),
        ))
        .await
        .unwrap();
    let other = registry
        .upsert(&RegisteredDevice::from_observation(
            &Observation::new("Shure").with_api_id("dev-7"),
        ))
        .await
        .unwrap();

    let obs = Observation::new("Shure")
        .with_serial("S1")
        .with_mac(mac("00:0e:dd:00:00:01"))
        .with_ip(ip("10.0.0.1"))
        .with_api_id("dev-7");
    let snapshot = registry.snapshot_for(&obs).await.unwrap();

    assert_eq!(snapshot.len(), 2);
    let ids: Vec<_> = snapshot.devices().iter().map(|d| d.id).collect();
    assert!(ids.contains(&device.id));
    assert!(ids.contains(&other.id));
}

#[tokio::test]
async fn test_refresh_writes_only_descriptive_fields() {
    let (_dir, registry) = registry().await;
    let device = registry
        .upsert(&RegisteredDevice::from_observation(
            &Observation::new("Shure").with_serial("S1").with_ip(ip("10.0.0.1")),
        ))
        .await
        .unwrap();

    // Stale copy: someone else moved the device after it was read
    let mut moved = device.clone();
    moved.ip = Some(ip("10.0.0.2"));
    registry.upsert(&moved).await.unwrap();

    let mut stale = device.clone();
    stale.firmware_version = Some("3.0".to_string());
    stale.last_seen = device.last_seen + Duration::minutes(1);
    let stored = registry.refresh(&stale).await.unwrap();

    assert_eq!(stored.ip, Some(ip("10.0.0.2")));
    assert_eq!(stored.serial_number.as_deref(), Some("S1"));
    assert_eq!(stored.firmware_version.as_deref(), Some("3.0"));
    assert_eq!(stored.last_seen, stale.last_seen);

    // last_seen never moves backwards
    let mut older = stored.clone();
    older.last_seen = device.last_seen;
    let stored = registry.refresh(&older).await.unwrap();
    assert_eq!(stored.last_seen, stale.last_seen);
}

#[tokio::test]
async fn test_refresh_of_unknown_device_is_not_found() {
    let (_dir, registry) = registry().await;
    let ghost = RegisteredDevice::from_observation(&Observation::new("Shure").with_serial("S1"));
    assert!(matches!(
        registry.refresh(&ghost).await,
        Err(ReconError::NotFound(_))
    ));
}
