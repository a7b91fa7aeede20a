//! Discovery queue manager
//!
//! Owns every status change of a queue entry:
//!
//! ```text
//! pending ──approve──▶ approved ──import ok──▶ imported
//!    │  ▲                  │
//!    │  └──import failed───┘
//!    ├──reject─────────▶ rejected
//!    └──mark_duplicate─▶ duplicate
//! ```
//!
//! Each transition is a compare-and-swap on (status, revision). A reviewer
//! acting on an outdated view gets `StaleState`; acting on a closed entry
//! gets `InvalidStateTransition`.

use devrec_common::{EventBus, ReconEvent};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use super::movement_log::MovementLog;
use crate::db::queue::{self as queue_db, Enqueued, NewQueueEntry, Transition};
use crate::error::{ReconError, ReconResult};
use crate::models::{
    ClassificationKind, Observation, QueueCounts, QueueFilter, QueueStatus, QueuedDevice,
    RegisteredDevice, ReviewRequest,
};
use crate::registry::DeviceRegistry;

pub struct DiscoveryQueue {
    db: SqlitePool,
    registry: Arc<dyn DeviceRegistry>,
    movement_log: MovementLog,
    event_bus: EventBus,
    system_reviewer: String,
}

impl DiscoveryQueue {
    pub fn new(
        db: SqlitePool,
        registry: Arc<dyn DeviceRegistry>,
        movement_log: MovementLog,
        event_bus: EventBus,
        system_reviewer: impl Into<String>,
    ) -> Self {
        Self {
            db,
            registry,
            movement_log,
            event_bus,
            system_reviewer: system_reviewer.into(),
        }
    }

    /// Stage `observation` for review
    ///
    /// A pending entry for the same identity and classification is refreshed
    /// (last_seen_at, sighting_count, raw metadata, revision) instead of
    /// duplicated. An entry being imported right now is left alone.
    pub async fn enqueue(
        &self,
        observation: &Observation,
        review: &ReviewRequest,
    ) -> ReconResult<QueuedDevice> {
        if !review.kind.requires_review() {
            return Err(ReconError::Classification(format!(
                "{} outcomes are applied automatically and cannot be queued",
                review.kind
            )));
        }
        let identity_key = observation.identity_key().ok_or_else(|| {
            ReconError::Validation(format!(
                "{} observation has no identity key",
                observation.manufacturer
            ))
        })?;

        let now = devrec_common::time::now();
        let entry = NewQueueEntry {
            observation,
            identity_key,
            classification: review.kind,
            flags: review.flags,
            reason: &review.reason,
            existing_device_id: review.existing_device.as_ref().map(|d| d.id),
            discovered_at: now,
        };

        let enqueued = queue_db::insert_or_refresh(&self.db, &entry).await?;
        let id = enqueued.id();
        let queued = self.require(id).await?;

        if let Enqueued::Created(_) = enqueued {
            tracing::info!(
                entry_id = %id,
                classification = %review.kind,
                observation = %observation.describe(),
                reason = %review.reason,
                "Queued observation for review"
            );
            self.event_bus.emit_lossy(ReconEvent::QueueEntryCreated {
                entry_id: id,
                manufacturer: queued.manufacturer.clone(),
                classification: review.kind.as_str().to_string(),
                timestamp: now,
            });
        } else {
            tracing::debug!(
                entry_id = %id,
                status = %queued.status,
                sighting_count = queued.sighting_count,
                "Observation matches an open queue entry"
            );
        }

        Ok(queued)
    }

    /// Approve a pending entry and import it into the registry
    ///
    /// An ambiguous entry is applied to its linked device; an entry whose
    /// mac (or serial, same manufacturer) is already registered is applied
    /// to that device. Everything else becomes a new device. If the
    /// registry rejects the write the entry returns to `pending` with
    /// `last_error` set.
    pub async fn approve(
        &self,
        id: Uuid,
        reviewer: &str,
        expected_revision: Option<i64>,
    ) -> ReconResult<RegisteredDevice> {
        let entry = self.load_pending(id, expected_revision, "approve").await?;

        self.swap(
            &entry,
            Transition {
                from: QueueStatus::Pending,
                to: QueueStatus::Approved,
                expected_revision: entry.revision,
                reviewed_by: Some(reviewer),
                last_error: None,
                clear_error: false,
                imported_device_id: None,
                at: devrec_common::time::now(),
            },
        )
        .await?;
        let approved_revision = entry.revision + 1;

        match self.import(&entry, reviewer).await {
            Ok(device) => {
                self.swap(
                    &entry,
                    Transition {
                        from: QueueStatus::Approved,
                        to: QueueStatus::Imported,
                        expected_revision: approved_revision,
                        reviewed_by: Some(reviewer),
                        last_error: None,
                        clear_error: true,
                        imported_device_id: Some(device.id),
                        at: devrec_common::time::now(),
                    },
                )
                .await?;

                tracing::info!(
                    entry_id = %id,
                    device_id = %device.id,
                    reviewer,
                    "Queue entry imported"
                );
                Ok(device)
            }
            Err(err) => {
                let message = err.to_string();
                tracing::warn!(
                    entry_id = %id,
                    reviewer,
                    error = %message,
                    "Import failed, returning queue entry to pending"
                );

                let revert = self
                    .swap(
                        &entry,
                        Transition {
                            from: QueueStatus::Approved,
                            to: QueueStatus::Pending,
                            expected_revision: approved_revision,
                            reviewed_by: Some(reviewer),
                            last_error: Some(&message),
                            clear_error: false,
                            imported_device_id: None,
                            at: devrec_common::time::now(),
                        },
                    )
                    .await;
                if let Err(revert_err) = revert {
                    tracing::error!(
                        entry_id = %id,
                        error = %revert_err,
                        "Failed to return queue entry to pending"
                    );
                }

                Err(err)
            }
        }
    }

    /// Close a pending entry without touching the registry
    pub async fn reject(
        &self,
        id: Uuid,
        reviewer: &str,
        expected_revision: Option<i64>,
    ) -> ReconResult<QueuedDevice> {
        self.close(id, reviewer, expected_revision, QueueStatus::Rejected, "reject")
            .await
    }

    /// Close a pending entry as a repeat report of a known device
    pub async fn mark_duplicate(
        &self,
        id: Uuid,
        reviewer: &str,
        expected_revision: Option<i64>,
    ) -> ReconResult<QueuedDevice> {
        self.close(
            id,
            reviewer,
            expected_revision,
            QueueStatus::Duplicate,
            "mark as duplicate",
        )
        .await
    }

    /// Mark pending entries claiming the same serial or mac as `observation`
    /// (same manufacturer) as duplicates, once the device has been resolved
    /// automatically
    pub async fn supersede_pending(&self, observation: &Observation) -> ReconResult<Vec<QueuedDevice>> {
        let candidates = queue_db::find_pending_for_identity(
            &self.db,
            &observation.manufacturer,
            observation.serial_number.as_deref(),
            observation.mac_address.as_ref(),
        )
        .await?;

        let mut superseded = Vec::with_capacity(candidates.len());
        for entry in candidates {
            let result = self
                .swap(
                    &entry,
                    Transition {
                        from: QueueStatus::Pending,
                        to: QueueStatus::Duplicate,
                        expected_revision: entry.revision,
                        reviewed_by: Some(self.system_reviewer.as_str()),
                        last_error: None,
                        clear_error: false,
                        imported_device_id: None,
                        at: devrec_common::time::now(),
                    },
                )
                .await;

            match result {
                Ok(updated) => {
                    tracing::info!(
                        entry_id = %updated.id,
                        observation = %observation.describe(),
                        "Pending queue entry superseded by automatic resolution"
                    );
                    superseded.push(updated);
                }
                // A reviewer got there first
                Err(ReconError::StaleState { .. }) => {
                    tracing::debug!(entry_id = %entry.id, "Queue entry changed while superseding");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(superseded)
    }

    pub async fn get(&self, id: Uuid) -> ReconResult<Option<QueuedDevice>> {
        queue_db::get(&self.db, id).await
    }

    /// Pending entries matching `filter`, oldest first
    pub async fn list_pending(&self, filter: &QueueFilter) -> ReconResult<Vec<QueuedDevice>> {
        queue_db::list_by_status(&self.db, QueueStatus::Pending, filter).await
    }

    pub async fn counts(&self) -> ReconResult<QueueCounts> {
        queue_db::counts(&self.db).await
    }

    async fn close(
        &self,
        id: Uuid,
        reviewer: &str,
        expected_revision: Option<i64>,
        to: QueueStatus,
        action: &'static str,
    ) -> ReconResult<QueuedDevice> {
        let entry = self.load_pending(id, expected_revision, action).await?;

        let updated = self
            .swap(
                &entry,
                Transition {
                    from: QueueStatus::Pending,
                    to,
                    expected_revision: entry.revision,
                    reviewed_by: Some(reviewer),
                    last_error: None,
                    clear_error: false,
                    imported_device_id: None,
                    at: devrec_common::time::now(),
                },
            )
            .await?;

        tracing::info!(entry_id = %id, reviewer, status = %to, "Queue entry closed");
        Ok(updated)
    }

    async fn import(&self, entry: &QueuedDevice, reviewer: &str) -> ReconResult<RegisteredDevice> {
        let observation = entry.to_observation();

        if let Some(device) = self.import_target(entry, &observation).await? {
            return self.apply_to_existing(entry, device, &observation, reviewer).await;
        }

        let device = self
            .registry
            .upsert(&RegisteredDevice::from_observation(&observation))
            .await?;

        self.event_bus.emit_lossy(ReconEvent::DeviceRegistered {
            device_id: device.id,
            manufacturer: device.manufacturer.clone(),
            timestamp: devrec_common::time::now(),
        });

        Ok(device)
    }

    /// Registered device an approved entry must be merged into, if any
    ///
    /// An ambiguous entry goes to its linked device. Any entry goes to the
    /// device already holding its mac, or its serial under the same
    /// manufacturer, since a second device could never be stored next to it.
    async fn import_target(
        &self,
        entry: &QueuedDevice,
        observation: &Observation,
    ) -> ReconResult<Option<RegisteredDevice>> {
        if entry.classification == ClassificationKind::Ambiguous {
            if let Some(existing_id) = entry.existing_device_id {
                match self.registry.get(existing_id).await? {
                    Some(device) => return Ok(Some(device)),
                    None => tracing::warn!(
                        entry_id = %entry.id,
                        device_id = %existing_id,
                        "Linked device no longer exists"
                    ),
                }
            }
        }

        if let Some(mac) = &observation.mac_address {
            if let Some(device) = self.registry.find_by_mac(mac).await? {
                return Ok(Some(device));
            }
        }
        if let Some(serial) = &observation.serial_number {
            if let Some(device) = self
                .registry
                .find_by_serial(&observation.manufacturer, serial)
                .await?
            {
                if device.is_manufacturer(&observation.manufacturer) {
                    return Ok(Some(device));
                }
            }
        }

        Ok(None)
    }

    async fn apply_to_existing(
        &self,
        entry: &QueuedDevice,
        mut device: RegisteredDevice,
        observation: &Observation,
        reviewer: &str,
    ) -> ReconResult<RegisteredDevice> {
        let old_ip = device.ip;
        device.apply_reviewed(observation);

        tracing::info!(
            entry_id = %entry.id,
            device_id = %device.id,
            "Approved entry merged into registered device"
        );

        match observation.ip.filter(|ip| old_ip != Some(*ip)) {
            Some(new_ip) => {
                device.ip = Some(new_ip);
                let (device, _movement) = self
                    .movement_log
                    .relocate(
                        self.registry.as_ref(),
                        &device,
                        old_ip,
                        reviewer,
                        &format!("approved review of queue entry {}", entry.id),
                    )
                    .await?;
                Ok(device)
            }
            None => {
                let device = self.registry.upsert(&device).await?;
                self.event_bus.emit_lossy(ReconEvent::DeviceRefreshed {
                    device_id: device.id,
                    timestamp: devrec_common::time::now(),
                });
                Ok(device)
            }
        }
    }

    /// Entry `id`, checked to be pending at the revision the caller saw
    async fn load_pending(
        &self,
        id: Uuid,
        expected_revision: Option<i64>,
        action: &'static str,
    ) -> ReconResult<QueuedDevice> {
        let entry = self.require(id).await?;

        if let Some(expected) = expected_revision {
            if expected != entry.revision {
                return Err(ReconError::StaleState {
                    entry_id: id,
                    expected,
                    actual: entry.revision,
                });
            }
        }

        if entry.status != QueueStatus::Pending {
            tracing::warn!(entry_id = %id, status = %entry.status, action, "Rejected queue transition");
            return Err(ReconError::InvalidStateTransition {
                entry_id: id,
                status: entry.status.to_string(),
                action,
            });
        }

        Ok(entry)
    }

    /// Apply `transition`, mapping a lost compare-and-swap to `StaleState`
    async fn swap(
        &self,
        entry: &QueuedDevice,
        transition: Transition<'_>,
    ) -> ReconResult<QueuedDevice> {
        let swapped = queue_db::compare_and_swap(&self.db, entry.id, &transition).await?;
        let current = self.require(entry.id).await?;

        if !swapped {
            return Err(ReconError::StaleState {
                entry_id: entry.id,
                expected: transition.expected_revision,
                actual: current.revision,
            });
        }

        self.event_bus.emit_lossy(ReconEvent::QueueEntryTransitioned {
            entry_id: entry.id,
            old_status: transition.from.as_str().to_string(),
            new_status: transition.to.as_str().to_string(),
            reviewed_by: transition.reviewed_by.map(str::to_string),
            timestamp: transition.at,
        });

        Ok(current)
    }

    async fn require(&self, id: Uuid) -> ReconResult<QueuedDevice> {
        queue_db::get(&self.db, id)
            .await?
            .ok_or_else(|| ReconError::NotFound(format!("queue entry {}", id)))
    }
}
