//! Discovery queue database operations
//!
//! Every status change goes through [`compare_and_swap`], which only
//! succeeds when the row still has the status and revision the caller read.

use chrono::{DateTime, Utc};
use devrec_common::time::to_db_string;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::net::IpAddr;
use uuid::Uuid;

use super::{
    parse_column, parse_optional_timestamp, parse_optional_uuid, parse_timestamp, parse_uuid,
    parse_value,
};
use crate::error::{ReconError, ReconResult};
use crate::models::{
    ClassificationKind, ConflictFlags, MacAddress, Observation, QueueCounts, QueueFilter,
    QueueStatus, QueuedDevice,
};
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

const QUEUE_COLUMNS: &str = "id, manufacturer, serial_number, mac_address, ip, api_device_id, \
     subnet_mask, gateway, model, firmware_version, device_type, status, classification, reason, \
     is_ip_conflict, is_manufacturer_mismatch, existing_device_id, imported_device_id, metadata, \
     observed_at, discovered_at, last_seen_at, sighting_count, reviewed_by, reviewed_at, \
     last_error, revision";

/// Data for a new queue entry
#[derive(Debug, Clone)]
pub struct NewQueueEntry<'a> {
    pub observation: &'a Observation,
    pub identity_key: String,
    pub classification: ClassificationKind,
    pub flags: ConflictFlags,
    pub reason: &'a str,
    pub existing_device_id: Option<Uuid>,
    pub discovered_at: DateTime<Utc>,
}

/// A guarded status change
#[derive(Debug, Clone)]
pub struct Transition<'a> {
    pub from: QueueStatus,
    pub to: QueueStatus,
    pub expected_revision: i64,
    pub reviewed_by: Option<&'a str>,
    pub last_error: Option<&'a str>,
    /// Drop any earlier error annotation
    pub clear_error: bool,
    pub imported_device_id: Option<Uuid>,
    pub at: DateTime<Utc>,
}

/// What [`insert_or_refresh`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Created(Uuid),
    /// Pending entry refreshed; its revision moved on
    Refreshed(Uuid),
    /// Open entry is mid-import and was not touched
    Unchanged(Uuid),
}

impl Enqueued {
    pub fn id(self) -> Uuid {
        match self {
            Enqueued::Created(id) | Enqueued::Refreshed(id) | Enqueued::Unchanged(id) => id,
        }
    }
}

/// Insert a pending entry, or refresh the pending entry with the same
/// identity key and classification
///
/// A refresh bumps the revision so reviewers holding the old one get
/// `StaleState`. An `approved` entry is never refreshed.
pub async fn insert_or_refresh(
    pool: &SqlitePool,
    entry: &NewQueueEntry<'_>,
) -> ReconResult<Enqueued> {
    let new_id = Uuid::new_v4().to_string();

    // Two rounds: the approved entry that blocked the first insert may
    // close before it can be looked up
    for _ in 0..2 {
        match upsert_open_entry(pool, entry, &new_id).await? {
            Some((id, 0)) => return Ok(Enqueued::Created(parse_uuid(&id, "id")?)),
            Some((id, _)) => return Ok(Enqueued::Refreshed(parse_uuid(&id, "id")?)),
            None => {
                let open: Option<String> = sqlx::query_scalar(
                    r#"
                    SELECT id FROM discovery_queue
                    WHERE identity_key = ? AND classification = ?
                      AND status IN ('pending', 'approved')
                    "#,
                )
                .bind(&entry.identity_key)
                .bind(entry.classification.as_str())
                .fetch_optional(pool)
                .await?;

                if let Some(id) = open {
                    return Ok(Enqueued::Unchanged(parse_uuid(&id, "id")?));
                }
            }
        }
    }

    Err(ReconError::Common(devrec_common::Error::Internal(format!(
        "open queue entry for {} kept changing during enqueue",
        entry.identity_key
    ))))
}

/// Insert `entry`, or refresh the pending entry it collides with
///
/// Returns the (id, revision) written, or `None` when the colliding entry
/// is approved and was left alone.
async fn upsert_open_entry(
    pool: &SqlitePool,
    entry: &NewQueueEntry<'_>,
    new_id: &str,
) -> ReconResult<Option<(String, i64)>> {
    let obs = entry.observation;
    let mac = obs.mac_address.as_ref().map(|m| m.to_string());
    let ip = obs.ip.map(|ip| ip.to_string());
    let metadata = serde_json::to_string(&obs.metadata)?;
    let existing_device_id = entry.existing_device_id.map(|id| id.to_string());
    let observed_at = to_db_string(&obs.observed_at);
    let discovered_at = to_db_string(&entry.discovered_at);

    retry_on_lock("queue insert_or_refresh", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let row: Option<(String, i64)> = sqlx::query_as(
            r#"
            INSERT INTO discovery_queue (
                id, manufacturer, serial_number, mac_address, ip, api_device_id,
                subnet_mask, gateway, model, firmware_version, device_type,
                status, classification, reason, is_ip_conflict, is_manufacturer_mismatch,
                existing_device_id, identity_key, metadata,
                observed_at, discovered_at, last_seen_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (identity_key, classification) WHERE status IN ('pending', 'approved')
            DO UPDATE SET
                ip = excluded.ip,
                subnet_mask = COALESCE(excluded.subnet_mask, subnet_mask),
                gateway = COALESCE(excluded.gateway, gateway),
                model = COALESCE(excluded.model, model),
                firmware_version = COALESCE(excluded.firmware_version, firmware_version),
                device_type = COALESCE(excluded.device_type, device_type),
                reason = excluded.reason,
                is_ip_conflict = excluded.is_ip_conflict,
                is_manufacturer_mismatch = excluded.is_manufacturer_mismatch,
                existing_device_id = COALESCE(excluded.existing_device_id, existing_device_id),
                metadata = excluded.metadata,
                observed_at = MAX(observed_at, excluded.observed_at),
                last_seen_at = excluded.last_seen_at,
                sighting_count = sighting_count + 1,
                revision = revision + 1
            WHERE status = 'pending'
            RETURNING id, revision
            "#,
        )
        .bind(new_id)
        .bind(&obs.manufacturer)
        .bind(&obs.serial_number)
        .bind(&mac)
        .bind(&ip)
        .bind(&obs.api_device_id)
        .bind(&obs.subnet_mask)
        .bind(&obs.gateway)
        .bind(&obs.model)
        .bind(&obs.firmware_version)
        .bind(&obs.device_type)
        .bind(entry.classification.as_str())
        .bind(entry.reason)
        .bind(entry.flags.is_ip_conflict)
        .bind(entry.flags.is_manufacturer_mismatch)
        .bind(&existing_device_id)
        .bind(&entry.identity_key)
        .bind(&metadata)
        .bind(&observed_at)
        .bind(&discovered_at)
        .bind(&discovered_at)
        .fetch_optional(pool)
        .await?;

        Ok(row)
    })
    .await
}

pub async fn get(pool: &SqlitePool, id: Uuid) -> ReconResult<Option<QueuedDevice>> {
    let sql = format!("SELECT {} FROM discovery_queue WHERE id = ?", QUEUE_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(entry_from_row).transpose()
}

/// Entries in `status` matching `filter`, oldest first
pub async fn list_by_status(
    pool: &SqlitePool,
    status: QueueStatus,
    filter: &QueueFilter,
) -> ReconResult<Vec<QueuedDevice>> {
    let sql = format!(
        r#"
        SELECT {} FROM discovery_queue
        WHERE status = ?
          AND (? IS NULL OR manufacturer = ? COLLATE NOCASE)
          AND (? IS NULL OR is_ip_conflict = ?)
          AND (? IS NULL OR is_manufacturer_mismatch = ?)
        ORDER BY discovered_at, id
        "#,
        QUEUE_COLUMNS
    );

    let rows = sqlx::query(&sql)
        .bind(status.as_str())
        .bind(&filter.manufacturer)
        .bind(&filter.manufacturer)
        .bind(filter.ip_conflict)
        .bind(filter.ip_conflict)
        .bind(filter.manufacturer_mismatch)
        .bind(filter.manufacturer_mismatch)
        .fetch_all(pool)
        .await?;

    rows.iter().map(entry_from_row).collect()
}

/// Pending entries of `manufacturer` that claim `serial` or `mac`
pub async fn find_pending_for_identity(
    pool: &SqlitePool,
    manufacturer: &str,
    serial: Option<&str>,
    mac: Option<&MacAddress>,
) -> ReconResult<Vec<QueuedDevice>> {
    if serial.is_none() && mac.is_none() {
        return Ok(Vec::new());
    }

    let sql = format!(
        r#"
        SELECT {} FROM discovery_queue
        WHERE status = 'pending'
          AND manufacturer = ? COLLATE NOCASE
          AND ((? IS NOT NULL AND serial_number = ?) OR (? IS NOT NULL AND mac_address = ?))
        ORDER BY discovered_at, id
        "#,
        QUEUE_COLUMNS
    );
    let mac = mac.map(|m| m.as_str());

    let rows = sqlx::query(&sql)
        .bind(manufacturer)
        .bind(serial)
        .bind(serial)
        .bind(mac)
        .bind(mac)
        .fetch_all(pool)
        .await?;

    rows.iter().map(entry_from_row).collect()
}

/// Apply `transition` if the entry still has its `from` status and
/// expected revision; returns whether the row was updated
pub async fn compare_and_swap(
    pool: &SqlitePool,
    id: Uuid,
    transition: &Transition<'_>,
) -> ReconResult<bool> {
    let id = id.to_string();
    let at = to_db_string(&transition.at);
    let imported_device_id = transition.imported_device_id.map(|id| id.to_string());

    let rows_affected = retry_on_lock("queue compare_and_swap", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            UPDATE discovery_queue SET
                status = ?,
                revision = revision + 1,
                reviewed_by = COALESCE(?, reviewed_by),
                reviewed_at = CASE WHEN ? IS NULL THEN reviewed_at ELSE ? END,
                last_error = CASE WHEN ? THEN NULL ELSE COALESCE(?, last_error) END,
                imported_device_id = COALESCE(?, imported_device_id)
            WHERE id = ? AND status = ? AND revision = ?
            "#,
        )
        .bind(transition.to.as_str())
        .bind(transition.reviewed_by)
        .bind(transition.reviewed_by)
        .bind(&at)
        .bind(transition.clear_error)
        .bind(transition.last_error)
        .bind(&imported_device_id)
        .bind(&id)
        .bind(transition.from.as_str())
        .bind(transition.expected_revision)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    })
    .await?;

    Ok(rows_affected == 1)
}

pub async fn counts(pool: &SqlitePool) -> ReconResult<QueueCounts> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM discovery_queue GROUP BY status")
            .fetch_all(pool)
            .await?;

    let mut counts = QueueCounts::default();
    for (status, count) in rows {
        match parse_value::<QueueStatus>(&status, "status")? {
            QueueStatus::Pending => counts.pending = count,
            QueueStatus::Approved => counts.approved = count,
            QueueStatus::Rejected => counts.rejected = count,
            QueueStatus::Imported => counts.imported = count,
            QueueStatus::Duplicate => counts.duplicate = count,
        }
    }
    Ok(counts)
}

fn entry_from_row(row: &SqliteRow) -> ReconResult<QueuedDevice> {
    let id: String = row.try_get("id")?;
    let mac: Option<String> = row.try_get("mac_address")?;
    let status: String = row.try_get("status")?;
    let classification: String = row.try_get("classification")?;
    let metadata: String = row.try_get("metadata")?;
    let observed_at: String = row.try_get("observed_at")?;
    let discovered_at: String = row.try_get("discovered_at")?;
    let last_seen_at: String = row.try_get("last_seen_at")?;

    Ok(QueuedDevice {
        id: parse_uuid(&id, "id")?,
        manufacturer: row.try_get("manufacturer")?,
        serial_number: row.try_get("serial_number")?,
        mac_address: mac.as_deref().and_then(MacAddress::parse),
        ip: parse_column::<IpAddr>(row.try_get("ip")?, "ip")?,
        api_device_id: row.try_get("api_device_id")?,
        subnet_mask: row.try_get("subnet_mask")?,
        gateway: row.try_get("gateway")?,
        model: row.try_get("model")?,
        firmware_version: row.try_get("firmware_version")?,
        device_type: row.try_get("device_type")?,
        status: parse_value(&status, "status")?,
        classification: parse_value(&classification, "classification")?,
        reason: row.try_get("reason")?,
        flags: ConflictFlags {
            is_ip_conflict: row.try_get("is_ip_conflict")?,
            is_manufacturer_mismatch: row.try_get("is_manufacturer_mismatch")?,
        },
        existing_device_id: parse_optional_uuid(
            row.try_get("existing_device_id")?,
            "existing_device_id",
        )?,
        imported_device_id: parse_optional_uuid(
            row.try_get("imported_device_id")?,
            "imported_device_id",
        )?,
        metadata: serde_json::from_str(&metadata)?,
        observed_at: parse_timestamp(&observed_at, "observed_at")?,
        discovered_at: parse_timestamp(&discovered_at, "discovered_at")?,
        last_seen_at: parse_timestamp(&last_seen_at, "last_seen_at")?,
        sighting_count: row.try_get("sighting_count")?,
        reviewed_by: row.try_get("reviewed_by")?,
        reviewed_at: parse_optional_timestamp(row.try_get("reviewed_at")?, "reviewed_at")?,
        last_error: row.try_get("last_error")?,
        revision: row.try_get("revision")?,
    })
}
