//! Movement log recorder
//!
//! Append-only audit trail of auto-applied address changes. Records start
//! unacknowledged; acknowledgment is an audit signal and never gates
//! further movements of the same device.

use devrec_common::{EventBus, ReconEvent};
use sqlx::SqlitePool;
use std::net::IpAddr;
use uuid::Uuid;

use crate::db::movements;
use crate::error::{ReconError, ReconResult};
use crate::models::{MovementFilter, MovementRecord, RegisteredDevice};
use crate::registry::DeviceRegistry;

#[derive(Debug, Clone)]
pub struct MovementLog {
    db: SqlitePool,
    event_bus: EventBus,
}

impl MovementLog {
    pub fn new(db: SqlitePool, event_bus: EventBus) -> Self {
        Self { db, event_bus }
    }

    /// Append one unacknowledged record for an already-stored `device`
    pub async fn record_movement(
        &self,
        device: &RegisteredDevice,
        old_ip: Option<IpAddr>,
        new_ip: IpAddr,
        detected_by: &str,
        reason: &str,
    ) -> ReconResult<MovementRecord> {
        self.warn_if_outstanding(device).await?;
        let record = new_record(device, old_ip, new_ip, detected_by, reason);
        movements::insert(&self.db, &record).await?;
        self.announce(&record);
        Ok(record)
    }

    /// Store a relocated `device` together with its movement record
    ///
    /// Either both land or neither does. Registries that cannot share a
    /// transaction with the log get the record first; it is removed again
    /// when the device write fails.
    pub async fn relocate(
        &self,
        registry: &dyn DeviceRegistry,
        device: &RegisteredDevice,
        old_ip: Option<IpAddr>,
        detected_by: &str,
        reason: &str,
    ) -> ReconResult<(RegisteredDevice, MovementRecord)> {
        let new_ip = device.ip.ok_or_else(|| {
            ReconError::Classification(format!("relocated device {} has no ip", device.id))
        })?;

        self.warn_if_outstanding(device).await?;
        let record = new_record(device, old_ip, new_ip, detected_by, reason);

        let stored = match registry.upsert_relocated(device, &record).await? {
            Some(stored) => stored,
            None => {
                movements::insert(&self.db, &record).await?;
                match registry.upsert(device).await {
                    Ok(stored) => stored,
                    Err(err) => {
                        if let Err(undo_err) = movements::delete(&self.db, record.id).await {
                            tracing::error!(
                                movement_id = %record.id,
                                error = %undo_err,
                                "Failed to remove movement of an unapplied relocation"
                            );
                        }
                        return Err(err);
                    }
                }
            }
        };

        self.announce(&record);
        Ok((stored, record))
    }

    async fn warn_if_outstanding(&self, device: &RegisteredDevice) -> ReconResult<()> {
        let outstanding = movements::count_unacknowledged_for_device(&self.db, device.id).await?;
        if outstanding > 0 {
            tracing::warn!(
                device_id = %device.id,
                outstanding,
                "Device moved again before earlier movements were acknowledged"
            );
        }
        Ok(())
    }

    fn announce(&self, record: &MovementRecord) {
        tracing::info!(
            movement_id = %record.id,
            device_id = %record.device_id,
            old_ip = ?record.old_ip,
            new_ip = %record.new_ip,
            detected_by = %record.detected_by,
            "Device movement recorded"
        );

        self.event_bus.emit_lossy(ReconEvent::DeviceMoved {
            device_id: record.device_id,
            movement_id: record.id,
            old_ip: record.old_ip.map(|ip| ip.to_string()),
            new_ip: record.new_ip.to_string(),
            timestamp: record.recorded_at,
        });
    }

    /// Acknowledge a record; an already-acknowledged record is returned unchanged
    pub async fn acknowledge(&self, movement_id: Uuid, reviewer: &str) -> ReconResult<MovementRecord> {
        let now = devrec_common::time::now();
        let flipped = movements::acknowledge(&self.db, movement_id, reviewer, now).await?;

        let record = movements::get(&self.db, movement_id)
            .await?
            .ok_or_else(|| ReconError::NotFound(format!("movement {}", movement_id)))?;

        if flipped {
            tracing::info!(movement_id = %movement_id, reviewer, "Movement acknowledged");
            self.event_bus.emit_lossy(ReconEvent::MovementAcknowledged {
                movement_id,
                acknowledged_by: reviewer.to_string(),
                timestamp: now,
            });
        } else {
            tracing::debug!(movement_id = %movement_id, "Movement already acknowledged");
        }

        Ok(record)
    }

    pub async fn get(&self, movement_id: Uuid) -> ReconResult<Option<MovementRecord>> {
        movements::get(&self.db, movement_id).await
    }

    /// Unacknowledged records, oldest first
    pub async fn list_unacknowledged(
        &self,
        filter: &MovementFilter,
    ) -> ReconResult<Vec<MovementRecord>> {
        movements::list_unacknowledged(&self.db, filter).await
    }

    /// Full movement history of one device, oldest first
    pub async fn history(&self, device_id: Uuid) -> ReconResult<Vec<MovementRecord>> {
        movements::history(&self.db, device_id).await
    }
}

fn new_record(
    device: &RegisteredDevice,
    old_ip: Option<IpAddr>,
    new_ip: IpAddr,
    detected_by: &str,
    reason: &str,
) -> MovementRecord {
    MovementRecord {
        id: Uuid::new_v4(),
        device_id: device.id,
        manufacturer: device.manufacturer.clone(),
        old_ip,
        new_ip,
        detected_by: detected_by.to_string(),
        reason: reason.to_string(),
        acknowledged: false,
        acknowledged_by: None,
        acknowledged_at: None,
        recorded_at: devrec_common::time::now(),
    }
}
