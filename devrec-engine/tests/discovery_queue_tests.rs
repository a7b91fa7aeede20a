//! Discovery queue review workflow tests

mod helpers;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use devrec_common::ReconEvent;
use devrec_engine::commands::{ApproveCommand, MarkDuplicateCommand, RejectCommand};
use devrec_engine::models::{
    ClassificationKind, MacAddress, MovementRecord, Observation, QueueFilter, QueueStatus,
    QueuedDevice, RegisteredDevice,
};
use devrec_engine::{DeviceRegistry, ObservationOutcome, ReconError, ReconResult, SqliteRegistry};
use helpers::{ip, mac, registered, TestEnv};
use uuid::Uuid;

/// SQLite registry where another writer registers `intruder` just before
/// the first upsert lands
struct RacedUpsert {
    inner: Arc<SqliteRegistry>,
    intruder: Observation,
    raced: AtomicBool,
}

#[async_trait]
impl DeviceRegistry for RacedUpsert {
    async fn find_by_serial(
        &self,
        manufacturer: &str,
        serial: &str,
    ) -> ReconResult<Option<RegisteredDevice>> {
        self.inner.find_by_serial(manufacturer, serial).await
    }

    async fn find_by_mac(&self, mac: &MacAddress) -> ReconResult<Option<RegisteredDevice>> {
        self.inner.find_by_mac(mac).await
    }

    async fn find_by_ip(&self, ip: IpAddr) -> ReconResult<Option<RegisteredDevice>> {
        self.inner.find_by_ip(ip).await
    }

    async fn find_by_api_id(
        &self,
        manufacturer: &str,
        api_id: &str,
    ) -> ReconResult<Option<RegisteredDevice>> {
        self.inner.find_by_api_id(manufacturer, api_id).await
    }

    async fn upsert(&self, device: &RegisteredDevice) -> ReconResult<RegisteredDevice> {
        if !self.raced.swap(true, Ordering::SeqCst) {
            self.inner
                .upsert(&RegisteredDevice::from_observation(&self.intruder))
                .await?;
        }
        self.inner.upsert(device).await
    }

    async fn refresh(&self, device: &RegisteredDevice) -> ReconResult<RegisteredDevice> {
        self.inner.refresh(device).await
    }

    async fn upsert_relocated(
        &self,
        device: &RegisteredDevice,
        movement: &MovementRecord,
    ) -> ReconResult<Option<RegisteredDevice>> {
        self.inner.upsert_relocated(device, movement).await
    }

    async fn get(&self, id: Uuid) -> ReconResult<Option<RegisteredDevice>> {
        self.inner.get(id).await
    }
}

/// Device SA holds 10.0.0.1; a second device SB reports the same address
async fn queued_ip_conflict(env: &TestEnv) -> QueuedDevice {
    registered(
        env.registry.as_ref(),
        Observation::new("Shure").with_serial("SA").with_ip(ip("10.0.0.1")),
    )
    .await;

    let obs = Observation::new("Shure").with_serial("SB").with_ip(ip("10.0.0.1"));
    match env.reconciler.process_observation(&obs).await.unwrap() {
        ObservationOutcome::Queued { entry } => entry,
        other => panic!("expected queued, got {:?}", other),
    }
}

#[tokio::test]
async fn test_approve_imports_entry_as_new_device() {
    let env = TestEnv::new().await;
    let entry = queued_ip_conflict(&env).await;
    assert_eq!(entry.revision, 0);

    let device = ApproveCommand::new(entry.id, "alice")
        .at_revision(0)
        .execute(env.queue())
        .await
        .unwrap();

    assert_eq!(device.serial_number.as_deref(), Some("SB"));
    assert_eq!(device.ip, Some(ip("10.0.0.1")));
    assert_eq!(env.registry.count().await.unwrap(), 2);

    let stored = env.queue().get(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueueStatus::Imported);
    assert_eq!(stored.revision, 2);
    assert_eq!(stored.imported_device_id, Some(device.id));
    assert_eq!(stored.reviewed_by.as_deref(), Some("alice"));
    assert!(stored.reviewed_at.is_some());
    assert!(stored.last_error.is_none());
}

#[tokio::test]
async fn test_closed_entry_cannot_be_approved_again() {
    let env = TestEnv::new().await;
    let entry = queued_ip_conflict(&env).await;

    env.queue().approve(entry.id, "alice", None).await.unwrap();
    let result = env.queue().approve(entry.id, "bob", None).await;

    match result {
        Err(ReconError::InvalidStateTransition { entry_id, status, .. }) => {
            assert_eq!(entry_id, entry.id);
            assert_eq!(status, "imported");
        }
        other => panic!("expected invalid transition, got {:?}", other),
    }
    assert_eq!(env.registry.count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_concurrent_approvals_import_exactly_once() {
    let env = TestEnv::new().await;
    let entry = queued_ip_conflict(&env).await;

    let first = ApproveCommand::new(entry.id, "alice").at_revision(0);
    let second = ApproveCommand::new(entry.id, "bob").at_revision(0);
    let (a, b) = tokio::join!(first.execute(env.queue()), second.execute(env.queue()));

    let outcomes = [a, b];
    let imported = outcomes.iter().filter(|r| r.is_ok()).count();
    let stale = outcomes
        .iter()
        .filter(|r| matches!(r, Err(ReconError::StaleState { .. })))
        .count();
    assert_eq!(imported, 1);
    assert_eq!(stale, 1);

    assert_eq!(env.registry.count().await.unwrap(), 2);
    let stored = env.queue().get(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueueStatus::Imported);
}

#[tokio::test]
async fn test_stale_revision_is_refused() {
    let env = TestEnv::new().await;
    let entry = queued_ip_conflict(&env).await;

    let result = RejectCommand::new(entry.id, "alice")
        .at_revision(5)
        .execute(env.queue())
        .await;

    match result {
        Err(ReconError::StaleState {
            entry_id,
            expected,
            actual,
        }) => {
            assert_eq!(entry_id, entry.id);
            assert_eq!(expected, 5);
            assert_eq!(actual, 0);
        }
        other => panic!("expected stale state, got {:?}", other),
    }

    let stored = env.queue().get(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueueStatus::Pending);
}

#[tokio::test]
async fn test_failed_import_returns_entry_to_pending() {
    let env = TestEnv::wrapping(|inner| {
        Arc::new(RacedUpsert {
            inner,
            intruder: Observation::new("Shure").with_serial("SB"),
            raced: AtomicBool::new(false),
        }) as Arc<dyn DeviceRegistry>
    })
    .await;
    let entry = queued_ip_conflict(&env).await;

    // SB gets registered between loading the entry and importing it
    let result = env.queue().approve(entry.id, "alice", Some(0)).await;
    assert!(matches!(result, Err(ReconError::UpsertConflict(_))));

    let stored = env.queue().get(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueueStatus::Pending);
    assert_eq!(stored.revision, 2);
    assert!(stored.last_error.is_some());
    assert!(stored.imported_device_id.is_none());
    assert_eq!(env.registry.count().await.unwrap(), 2);

    // Retrying merges into the device that won the race
    let intruder = env.registry.find_by_serial("Shure", "SB").await.unwrap().unwrap();
    let device = env.queue().approve(entry.id, "alice", Some(2)).await.unwrap();
    assert_eq!(device.id, intruder.id);
    assert_eq!(device.ip, Some(ip("10.0.0.1")));
    assert_eq!(env.registry.count().await.unwrap(), 2);

    let stored = env.queue().get(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueueStatus::Imported);
    assert_eq!(stored.imported_device_id, Some(intruder.id));
    assert!(stored.last_error.is_none());
}

#[tokio::test]
async fn test_approving_mac_mismatch_merges_into_mac_holder() {
    let env = TestEnv::new().await;
    let holder = registered(
        env.registry.as_ref(),
        Observation::new("Shure")
            .with_serial("S1")
            .with_mac(mac("00:0e:dd:00:00:01")),
    )
    .await;

    let obs = Observation::new("Sennheiser")
        .with_serial("X9")
        .with_mac(mac("00:0e:dd:00:00:01"));
    let entry = match env.reconciler.process_observation(&obs).await.unwrap() {
        ObservationOutcome::Queued { entry } => entry,
        other => panic!("expected queued, got {:?}", other),
    };
    assert_eq!(entry.classification, ClassificationKind::ManufacturerMismatch);

    let device = env.queue().approve(entry.id, "alice", Some(0)).await.unwrap();
    assert_eq!(device.id, holder.id);
    assert_eq!(device.manufacturer, "Sennheiser");
    assert_eq!(device.mac_address, Some(mac("00:0e:dd:00:00:01")));
    assert_eq!(env.registry.count().await.unwrap(), 1);

    let stored = env.queue().get(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, QueueStatus::Imported);
    assert_eq!(stored.imported_device_id, Some(holder.id));
}

#[tokio::test]
async fn test_repeat_sighting_refreshes_open_entry() {
    let env = TestEnv::new().await;
    let entry = queued_ip_conflict(&env).await;

    let again = Observation::new("Shure").with_serial("SB").with_ip(ip("10.0.0.1"));
    let refreshed = match env.reconciler.process_observation(&again).await.unwrap() {
        ObservationOutcome::Queued { entry } => entry,
        other => panic!("expected queued, got {:?}", other),
    };

    assert_eq!(refreshed.id, entry.id);
    assert_eq!(refreshed.sighting_count, 2);
    assert_eq!(refreshed.revision, 1);
    assert!(refreshed.last_seen_at >= entry.last_seen_at);
    assert_eq!(env.queue().counts().await.unwrap().pending, 1);

    // A reviewer who loaded the entry before the sighting is now stale
    let result = env.queue().approve(entry.id, "alice", Some(0)).await;
    assert!(matches!(
        result,
        Err(ReconError::StaleState { expected: 0, actual: 1, .. })
    ));
}

#[tokio::test]
async fn test_sighting_leaves_entry_under_approval_untouched() {
    let env = TestEnv::new().await;
    let entry = queued_ip_conflict(&env).await;

    // Approval in progress: status flipped, import not finished yet
    sqlx::query("UPDATE discovery_queue SET status = 'approved', revision = 1 WHERE id = ?")
        .bind(entry.id.to_string())
        .execute(&env.db)
        .await
        .unwrap();

    let again = Observation::new("Shure").with_serial("SB").with_ip(ip("10.0.0.1"));
    let seen = match env.reconciler.process_observation(&again).await.unwrap() {
        ObservationOutcome::Queued { entry } => entry,
        other => panic!("expected queued, got {:?}", other),
    };

    assert_eq!(seen.id, entry.id);
    assert_eq!(seen.status, QueueStatus::Approved);
    assert_eq!(seen.revision, 1);
    assert_eq!(seen.sighting_count, 1);
    assert_eq!(seen.last_seen_at, entry.last_seen_at);
}

#[tokio::test]
async fn test_list_pending_filters_and_counts() {
    let env = TestEnv::new().await;
    queued_ip_conflict(&env).await;

    registered(env.registry.as_ref(), Observation::new("Shure").with_serial("S9")).await;
    env.reconciler
        .process_observation(&Observation::new("Sennheiser").with_serial("S9"))
        .await
        .unwrap();

    let all = env.queue().list_pending(&QueueFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all[0].discovered_at <= all[1].discovered_at);

    let conflicts = env
        .queue()
        .list_pending(&QueueFilter {
            ip_conflict: Some(true),
            ..QueueFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].classification, ClassificationKind::IpConflict);

    let sennheiser = env
        .queue()
        .list_pending(&QueueFilter {
            manufacturer: Some("Sennheiser".to_string()),
            ..QueueFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(sennheiser.len(), 1);
    assert_eq!(
        sennheiser[0].classification,
        ClassificationKind::ManufacturerMismatch
    );

    env.queue().reject(conflicts[0].id, "alice", None).await.unwrap();
    let counts = env.queue().counts().await.unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.rejected, 1);
    assert_eq!(counts.imported, 0);
}

#[tokio::test]
async fn test_approving_ambiguous_entry_updates_linked_device() {
    let env = TestEnv::new().await;
    let existing = registered(
        env.registry.as_ref(),
        Observation::new("Shure").with_api_id("dev-1").with_ip(ip("10.0.0.1")),
    )
    .await;

    let obs = Observation::new("Shure")
        .with_api_id("dev-1")
        .with_ip(ip("10.0.0.2"))
        .with_firmware("2.4.1");
    let entry = match env.reconciler.process_observation(&obs).await.unwrap() {
        ObservationOutcome::Queued { entry } => entry,
        other => panic!("expected queued, got {:?}", other),
    };
    assert_eq!(entry.classification, ClassificationKind::Ambiguous);
    assert_eq!(entry.existing_device_id, Some(existing.id));

    let device = env.queue().approve(entry.id, "carol", None).await.unwrap();
    assert_eq!(device.id, existing.id);
    assert_eq!(device.ip, Some(ip("10.0.0.2")));
    assert_eq!(env.registry.count().await.unwrap(), 1);

    let history = env.movements().history(existing.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].old_ip, Some(ip("10.0.0.1")));
    assert_eq!(history[0].detected_by, "carol");

    let stored = env.queue().get(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.imported_device_id, Some(existing.id));
}

#[tokio::test]
async fn test_rejected_entry_cannot_be_marked_duplicate() {
    let env = TestEnv::new().await;
    let entry = queued_ip_conflict(&env).await;

    let rejected = RejectCommand::new(entry.id, "alice")
        .execute(env.queue())
        .await
        .unwrap();
    assert_eq!(rejected.status, QueueStatus::Rejected);
    assert_eq!(rejected.revision, 1);

    let result = MarkDuplicateCommand::new(entry.id, "bob")
        .execute(env.queue())
        .await;
    assert!(matches!(
        result,
        Err(ReconError::InvalidStateTransition { .. })
    ));
    assert_eq!(env.registry.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_entry_is_not_found() {
    let env = TestEnv::new().await;
    let result = env.queue().approve(Uuid::new_v4(), "alice", None).await;
    assert!(matches!(result, Err(ReconError::NotFound(_))));
}

#[tokio::test]
async fn test_transitions_are_published() {
    let env = TestEnv::new().await;
    let entry = queued_ip_conflict(&env).await;
    let mut events = env.events.subscribe();

    env.queue().mark_duplicate(entry.id, "alice", None).await.unwrap();

    match events.recv().await.unwrap() {
        ReconEvent::QueueEntryTransitioned {
            entry_id,
            old_status,
            new_status,
            reviewed_by,
            ..
        } => {
            assert_eq!(entry_id, entry.id);
            assert_eq!(old_status, "pending");
            assert_eq!(new_status, "duplicate");
            assert_eq!(reviewed_by.as_deref(), Some("alice"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}
