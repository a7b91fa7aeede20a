//! Movement log tests

mod helpers;

use std::sync::Arc;

use devrec_common::config::ReconcileConfig;
use devrec_common::{EventBus, ReconEvent};
use devrec_engine::models::{ClassificationKind, MovementFilter, Observation, RegisteredDevice};
use devrec_engine::{
    DeviceRegistry, InMemoryRegistry, ObservationOutcome, ReconError, Reconciler,
};
use helpers::{create_test_db, ip, mac, registered, TestEnv};
use sqlx::SqlitePool;
use uuid::Uuid;

async fn block_movement_inserts(db: &SqlitePool) {
    sqlx::query(
        r#"
        CREATE TRIGGER block_movements BEFORE INSERT ON device_movements
        BEGIN
            SELECT RAISE(ABORT, 'movement log unavailable');
        END
        "#,
    )
    .execute(db)
    .await
    .unwrap();
}

async fn unblock_movement_inserts(db: &SqlitePool) {
    sqlx::query("DROP TRIGGER block_movements")
        .execute(db)
        .await
        .unwrap();
}

async fn move_device(env: &TestEnv, manufacturer: &str, serial: &str, from: &str, to: &str) -> Uuid {
    let device = registered(
        env.registry.as_ref(),
        Observation::new(manufacturer).with_serial(serial).with_ip(ip(from)),
    )
    .await;

    let obs = Observation::new(manufacturer).with_serial(serial).with_ip(ip(to));
    match env.reconciler.process_observation(&obs).await.unwrap() {
        ObservationOutcome::Moved { movement, .. } => movement.id,
        other => panic!("expected moved, got {:?}", other),
    };
    device.id
}

#[tokio::test]
async fn test_acknowledge_is_idempotent() {
    let env = TestEnv::new().await;
    let device_id = move_device(&env, "Shure", "S1", "10.0.0.1", "10.0.0.2").await;
    let movement = env.movements().history(device_id).await.unwrap().remove(0);

    let first = env.movements().acknowledge(movement.id, "alice").await.unwrap();
    assert!(first.acknowledged);
    assert_eq!(first.acknowledged_by.as_deref(), Some("alice"));
    let first_at = first.acknowledged_at.unwrap();

    let second = env.movements().acknowledge(movement.id, "bob").await.unwrap();
    assert!(second.acknowledged);
    assert_eq!(second.acknowledged_by.as_deref(), Some("alice"));
    assert_eq!(second.acknowledged_at, Some(first_at));

    let open = env
        .movements()
        .list_unacknowledged(&MovementFilter::default())
        .await
        .unwrap();
    assert!(open.is_empty());
}

#[tokio::test]
async fn test_unknown_movement_is_not_found() {
    let env = TestEnv::new().await;
    let result = env.movements().acknowledge(Uuid::new_v4(), "alice").await;
    assert!(matches!(result, Err(ReconError::NotFound(_))));
}

#[tokio::test]
async fn test_list_unacknowledged_filters() {
    let env = TestEnv::new().await;
    let shure = move_device(&env, "Shure", "S1", "10.0.0.1", "10.0.0.2").await;
    let sennheiser = move_device(&env, "Sennheiser", "E1", "10.0.1.1", "10.0.1.2").await;

    let all = env
        .movements()
        .list_unacknowledged(&MovementFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    assert!(all[0].recorded_at <= all[1].recorded_at);

    let by_manufacturer = env
        .movements()
        .list_unacknowledged(&MovementFilter {
            manufacturer: Some("Sennheiser".to_string()),
            ..MovementFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(by_manufacturer.len(), 1);
    assert_eq!(by_manufacturer[0].device_id, sennheiser);

    let by_device = env
        .movements()
        .list_unacknowledged(&MovementFilter {
            device_id: Some(shure),
            ..MovementFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(by_device.len(), 1);
    assert_eq!(by_device[0].manufacturer, "Shure");
    assert_eq!(by_device[0].detected_by, "system");
}

#[tokio::test]
async fn test_movement_and_acknowledgment_are_published() {
    let env = TestEnv::new().await;
    let device = registered(
        env.registry.as_ref(),
        Observation::new("Shure").with_serial("S1").with_ip(ip("10.0.0.1")),
    )
    .await;
    let mut events = env.events.subscribe();

    let obs = Observation::new("Shure").with_serial("S1").with_ip(ip("10.0.0.2"));
    env.reconciler.process_observation(&obs).await.unwrap();

    let movement_id = loop {
        match events.recv().await.unwrap() {
            ReconEvent::DeviceMoved {
                device_id,
                movement_id,
                old_ip,
                new_ip,
                ..
            } => {
                assert_eq!(device_id, device.id);
                assert_eq!(old_ip.as_deref(), Some("10.0.0.1"));
                assert_eq!(new_ip, "10.0.0.2");
                break movement_id;
            }
            _ => continue,
        }
    };

    env.movements().acknowledge(movement_id, "alice").await.unwrap();
    loop {
        match events.recv().await.unwrap() {
            ReconEvent::MovementAcknowledged {
                movement_id: acked,
                acknowledged_by,
                ..
            } => {
                assert_eq!(acked, movement_id);
                assert_eq!(acknowledged_by, "alice");
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_failed_movement_write_leaves_sqlite_device_in_place() {
    let env = TestEnv::new().await;
    let device = registered(
        env.registry.as_ref(),
        Observation::new("Shure").with_serial("S1").with_ip(ip("10.0.0.1")),
    )
    .await;
    let obs = Observation::new("Shure").with_serial("S1").with_ip(ip("10.0.0.2"));

    block_movement_inserts(&env.db).await;
    assert!(env.reconciler.process_observation(&obs).await.is_err());

    let stored = env.registry.get(device.id).await.unwrap().unwrap();
    assert_eq!(stored.ip, Some(ip("10.0.0.1")));
    assert!(env.movements().history(device.id).await.unwrap().is_empty());

    // The next sighting still sees the move
    unblock_movement_inserts(&env.db).await;
    let outcome = env.reconciler.process_observation(&obs).await.unwrap();
    assert_eq!(outcome.kind(), ClassificationKind::Moved);
    assert_eq!(env.movements().history(device.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_movement_write_leaves_in_memory_device_in_place() {
    let (_temp_dir, db) = create_test_db().await.unwrap();
    let registry = Arc::new(InMemoryRegistry::new());
    let reconciler = Reconciler::new(
        db.clone(),
        registry.clone(),
        EventBus::default(),
        ReconcileConfig::default(),
    );
    let device = registered(
        registry.as_ref(),
        Observation::new("Shure").with_serial("S1").with_ip(ip("10.0.0.1")),
    )
    .await;
    let obs = Observation::new("Shure").with_serial("S1").with_ip(ip("10.0.0.2"));

    block_movement_inserts(&db).await;
    assert!(reconciler.process_observation(&obs).await.is_err());
    let stored = registry.get(device.id).await.unwrap().unwrap();
    assert_eq!(stored.ip, Some(ip("10.0.0.1")));

    unblock_movement_inserts(&db).await;
    let outcome = reconciler.process_observation(&obs).await.unwrap();
    assert_eq!(outcome.kind(), ClassificationKind::Moved);
    assert_eq!(reconciler.movement_log().history(device.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_relocation_refused_by_registry_keeps_no_movement() {
    let env = TestEnv::new().await;
    let moving = RegisteredDevice::from_observation(
        &Observation::new("Shure")
            .with_serial("S1")
            .with_mac(mac("00:0e:dd:00:00:01"))
            .with_ip(ip("10.0.0.1")),
    );
    let holder = RegisteredDevice::from_observation(
        &Observation::new("Shure")
            .with_serial("S2")
            .with_mac(mac("00:0e:dd:00:00:01")),
    );
    // Seeded without uniqueness checks, so any write of `moving` conflicts
    let registry = InMemoryRegistry::with_devices([moving.clone(), holder]);

    let mut relocated = moving.clone();
    relocated.ip = Some(ip("10.0.0.2"));
    let result = env
        .movements()
        .relocate(&registry, &relocated, moving.ip, "system", "address changed")
        .await;

    assert!(matches!(result, Err(ReconError::UpsertConflict(_))));
    assert!(env.movements().history(moving.id).await.unwrap().is_empty());
    let stored = registry.get(moving.id).await.unwrap().unwrap();
    assert_eq!(stored.ip, Some(ip("10.0.0.1")));
}

#[tokio::test]
async fn test_record_movement_appends_to_history() {
    let env = TestEnv::new().await;
    let device = registered(
        env.registry.as_ref(),
        Observation::new("Shure").with_serial("S1").with_ip(ip("10.0.0.2")),
    )
    .await;

    let record = env
        .movements()
        .record_movement(&device, Some(ip("10.0.0.1")), ip("10.0.0.2"), "alice", "moved by hand")
        .await
        .unwrap();

    assert_eq!(record.device_id, device.id);
    assert_eq!(record.detected_by, "alice");
    assert!(!record.acknowledged);

    let history = env.movements().history(device.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, record.id);
    assert_eq!(history[0].reason, "moved by hand");
}
