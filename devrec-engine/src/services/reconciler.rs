//! Reconciliation pipeline
//!
//! normalize → lock identity → snapshot → resolve → classify → apply or queue
//!
//! One poll cycle processes its payloads with bounded concurrency; cycles
//! of different manufacturers run as separate tokio tasks. Errors are per
//! observation and end up in the [`CycleReport`].

use chrono::{DateTime, Utc};
use devrec_common::config::ReconcileConfig;
use devrec_common::{EventBus, ReconEvent};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;

use super::conflict_classifier::classify;
use super::discovery_queue::DiscoveryQueue;
use super::identity_locks::IdentityLocks;
use super::identity_resolver::resolve;
use super::movement_log::MovementLog;
use super::normalizer::normalize;
use crate::error::{ReconError, ReconResult};
use crate::models::{
    Classification, ClassificationKind, MovementRecord, Observation, QueuedDevice,
    RegisteredDevice,
};
use crate::registry::DeviceRegistry;

/// What happened to one observation
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ObservationOutcome {
    Registered { device: RegisteredDevice },
    Refreshed { device: RegisteredDevice },
    Moved {
        device: RegisteredDevice,
        movement: MovementRecord,
    },
    Queued { entry: QueuedDevice },
}

impl ObservationOutcome {
    pub fn kind(&self) -> ClassificationKind {
        match self {
            ObservationOutcome::Registered { .. } => ClassificationKind::New,
            ObservationOutcome::Refreshed { .. } => ClassificationKind::Duplicate,
            ObservationOutcome::Moved { .. } => ClassificationKind::Moved,
            ObservationOutcome::Queued { entry } => entry.classification,
        }
    }
}

/// One observation that could not be processed
#[derive(Debug, Clone, Serialize)]
pub struct ObservationFailure {
    /// Position of the payload in the cycle
    pub index: usize,
    pub code: &'static str,
    pub message: String,
}

/// Summary of one manufacturer's poll cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub manufacturer: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub received: usize,
    pub registered: usize,
    pub refreshed: usize,
    pub moved: usize,
    pub queued: usize,
    pub failures: Vec<ObservationFailure>,
}

impl CycleReport {
    fn new(manufacturer: &str, received: usize) -> Self {
        let now = devrec_common::time::now();
        Self {
            manufacturer: manufacturer.to_string(),
            started_at: now,
            finished_at: now,
            received,
            registered: 0,
            refreshed: 0,
            moved: 0,
            queued: 0,
            failures: Vec::new(),
        }
    }

    fn record(&mut self, index: usize, result: &ReconResult<ObservationOutcome>) {
        match result {
            Ok(ObservationOutcome::Registered { .. }) => self.registered += 1,
            Ok(ObservationOutcome::Refreshed { .. }) => self.refreshed += 1,
            Ok(ObservationOutcome::Moved { .. }) => self.moved += 1,
            Ok(ObservationOutcome::Queued { .. }) => self.queued += 1,
            Err(err) => self.failures.push(ObservationFailure {
                index,
                code: err.code(),
                message: err.to_string(),
            }),
        }
    }

    pub fn processed(&self) -> usize {
        self.registered + self.refreshed + self.moved + self.queued
    }
}

pub struct Reconciler {
    registry: Arc<dyn DeviceRegistry>,
    queue: DiscoveryQueue,
    movement_log: MovementLog,
    event_bus: EventBus,
    locks: IdentityLocks,
    settings: ReconcileConfig,
}

impl Reconciler {
    /// Queue and movement log live in `db`; devices live in `registry`
    pub fn new(
        db: SqlitePool,
        registry: Arc<dyn DeviceRegistry>,
        event_bus: EventBus,
        settings: ReconcileConfig,
    ) -> Self {
        let movement_log = MovementLog::new(db.clone(), event_bus.clone());
        let queue = DiscoveryQueue::new(
            db,
            Arc::clone(&registry),
            movement_log.clone(),
            event_bus.clone(),
            settings.system_reviewer.clone(),
        );

        Self {
            registry,
            queue,
            movement_log,
            event_bus,
            locks: IdentityLocks::new(),
            settings,
        }
    }

    pub fn queue(&self) -> &DiscoveryQueue {
        &self.queue
    }

    pub fn movement_log(&self) -> &MovementLog {
        &self.movement_log
    }

    pub fn registry(&self) -> &Arc<dyn DeviceRegistry> {
        &self.registry
    }

    /// Run several poll cycles in parallel, one task per cycle
    ///
    /// Reports come back in input order.
    pub async fn process_cycles(self: &Arc<Self>, cycles: Vec<(String, Vec<Value>)>) -> Vec<CycleReport> {
        let mut handles = Vec::with_capacity(cycles.len());
        for (manufacturer, payloads) in cycles {
            let reconciler = Arc::clone(self);
            let name = manufacturer.clone();
            let received = payloads.len();
            let handle = tokio::spawn(async move {
                reconciler.process_cycle(&manufacturer, payloads).await
            });
            handles.push((name, received, handle));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (manufacturer, received, handle) in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(err) => {
                    tracing::error!(manufacturer = %manufacturer, error = %err, "Poll cycle task failed");
                    let mut report = CycleReport::new(&manufacturer, received);
                    report.failures.push(ObservationFailure {
                        index: 0,
                        code: "INTERNAL",
                        message: format!("poll cycle task failed: {}", err),
                    });
                    reports.push(report);
                }
            }
        }
        reports
    }

    /// Process one manufacturer's payloads; never fails as a whole
    pub async fn process_cycle(&self, manufacturer: &str, payloads: Vec<Value>) -> CycleReport {
        let mut report = CycleReport::new(manufacturer, payloads.len());
        tracing::info!(manufacturer, observations = payloads.len(), "Poll cycle started");

        let mut results: Vec<(usize, ReconResult<ObservationOutcome>)> =
            stream::iter(payloads.into_iter().enumerate())
                .map(|(index, payload)| async move {
                    (index, self.process_payload(manufacturer, &payload).await)
                })
                .buffer_unordered(self.settings.max_concurrent_observations.max(1))
                .collect()
                .await;
        results.sort_by_key(|(index, _)| *index);

        for (index, result) in &results {
            report.record(*index, result);
        }
        report.finished_at = devrec_common::time::now();

        tracing::info!(
            manufacturer,
            received = report.received,
            registered = report.registered,
            refreshed = report.refreshed,
            moved = report.moved,
            queued = report.queued,
            failed = report.failures.len(),
            "Poll cycle finished"
        );

        report
    }

    /// Normalize and reconcile one raw payload
    pub async fn process_payload(
        &self,
        manufacturer: &str,
        payload: &Value,
    ) -> ReconResult<ObservationOutcome> {
        let observation = match normalize(manufacturer, payload) {
            Ok(observation) => observation,
            Err(err) => {
                tracing::warn!(manufacturer, error = %err, "Dropping observation");
                self.event_bus.emit_lossy(ReconEvent::ObservationRejected {
                    manufacturer: manufacturer.to_string(),
                    reason: err.to_string(),
                    timestamp: devrec_common::time::now(),
                });
                return Err(err);
            }
        };

        self.process_observation(&observation).await
    }

    /// Reconcile one validated observation
    pub async fn process_observation(
        &self,
        observation: &Observation,
    ) -> ReconResult<ObservationOutcome> {
        if !observation.has_identity() {
            return Err(ReconError::Validation(format!(
                "{} observation has no identity key",
                observation.manufacturer
            )));
        }

        let guard = self.locks.acquire(observation).await;
        let mut retried = false;

        loop {
            let snapshot = self.registry.snapshot_for(observation).await?;
            let result = resolve(observation, &snapshot);
            let classification = match classify(observation, &result) {
                Ok(classification) => classification,
                Err(err) => {
                    tracing::error!(
                        observation = %observation.describe(),
                        error = %err,
                        "Observation halted: needs operator attention"
                    );
                    return Err(err);
                }
            };

            if let Classification::Review(review) = classification {
                // Queue inserts are atomic on their own
                drop(guard);
                let entry = self.queue.enqueue(observation, &review).await?;
                return Ok(ObservationOutcome::Queued { entry });
            }

            match self.apply(observation, classification).await {
                Ok(outcome) => {
                    drop(guard);
                    self.supersede(observation).await;
                    return Ok(outcome);
                }
                Err(ReconError::UpsertConflict(message)) if !retried => {
                    tracing::warn!(
                        observation = %observation.describe(),
                        conflict = %message,
                        "Registry changed underneath, resolving again"
                    );
                    retried = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn apply(
        &self,
        observation: &Observation,
        classification: Classification,
    ) -> ReconResult<ObservationOutcome> {
        match classification {
            Classification::New => {
                let device = self
                    .registry
                    .upsert(&RegisteredDevice::from_observation(observation))
                    .await?;

                tracing::info!(
                    device_id = %device.id,
                    observation = %observation.describe(),
                    "Registered new device"
                );
                self.event_bus.emit_lossy(ReconEvent::DeviceRegistered {
                    device_id: device.id,
                    manufacturer: device.manufacturer.clone(),
                    timestamp: devrec_common::time::now(),
                });

                Ok(ObservationOutcome::Registered { device })
            }
            Classification::Duplicate {
                mut device,
                matched_priority,
            } => {
                device.refresh_from(observation);
                let device = self.registry.refresh(&device).await?;

                tracing::debug!(
                    device_id = %device.id,
                    matched_by = %matched_priority,
                    "Refreshed known device"
                );
                self.event_bus.emit_lossy(ReconEvent::DeviceRefreshed {
                    device_id: device.id,
                    timestamp: devrec_common::time::now(),
                });

                Ok(ObservationOutcome::Refreshed { device })
            }
            Classification::Moved {
                mut device,
                matched_priority,
                old_ip,
                new_ip,
            } => {
                device.relocate(new_ip, observation);

                let reason = match old_ip {
                    Some(old_ip) => format!(
                        "matched by {}; address changed from {} to {}",
                        matched_priority, old_ip, new_ip
                    ),
                    None => format!("matched by {}; first reported address {}", matched_priority, new_ip),
                };
                let (device, movement) = self
                    .movement_log
                    .relocate(
                        self.registry.as_ref(),
                        &device,
                        old_ip,
                        &self.settings.system_reviewer,
                        &reason,
                    )
                    .await?;

                Ok(ObservationOutcome::Moved { device, movement })
            }
            Classification::Review(review) => Err(ReconError::Classification(format!(
                "{} outcome cannot be applied automatically",
                review.kind
            ))),
        }
    }

    async fn supersede(&self, observation: &Observation) {
        if !self.settings.supersede_pending {
            return;
        }
        if let Err(err) = self.queue.supersede_pending(observation).await {
            tracing::warn!(
                observation = %observation.describe(),
                error = %err,
                "Failed to supersede pending queue entries"
            );
        }
    }
}
