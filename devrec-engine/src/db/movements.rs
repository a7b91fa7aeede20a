//! Device movement log database operations
//!
//! Rows are inserted once; the only update ever issued flips the
//! acknowledgment columns. `delete` exists only to undo a record whose
//! device write failed.

use chrono::{DateTime, Utc};
use devrec_common::time::to_db_string;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::net::IpAddr;
use uuid::Uuid;

use super::{parse_column, parse_optional_timestamp, parse_timestamp, parse_uuid, parse_value};
use crate::error::ReconResult;
use crate::models::{MovementFilter, MovementRecord};
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

const MOVEMENT_COLUMNS: &str = "id, device_id, manufacturer, old_ip, new_ip, detected_by, reason, \
     acknowledged, acknowledged_by, acknowledged_at, recorded_at";

pub async fn insert(pool: &SqlitePool, record: &MovementRecord) -> ReconResult<()> {
    retry_on_lock("movement insert", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let mut conn = pool.acquire().await?;
        insert_with(&mut conn, record).await
    })
    .await
}

/// Insert `record` on an existing connection or transaction
pub async fn insert_with(conn: &mut SqliteConnection, record: &MovementRecord) -> ReconResult<()> {
    sqlx::query(
        r#"
        INSERT INTO device_movements (
            id, device_id, manufacturer, old_ip, new_ip, detected_by, reason,
            acknowledged, recorded_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
        "#,
    )
    .bind(record.id.to_string())
    .bind(record.device_id.to_string())
    .bind(&record.manufacturer)
    .bind(record.old_ip.map(|ip| ip.to_string()))
    .bind(record.new_ip.to_string())
    .bind(&record.detected_by)
    .bind(&record.reason)
    .bind(to_db_string(&record.recorded_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Remove a record whose device write never landed
pub async fn delete(pool: &SqlitePool, id: Uuid) -> ReconResult<()> {
    let id = id.to_string();
    retry_on_lock("movement delete", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        sqlx::query("DELETE FROM device_movements WHERE id = ?")
            .bind(&id)
            .execute(pool)
            .await?;
        Ok(())
    })
    .await
}

pub async fn get(pool: &SqlitePool, id: Uuid) -> ReconResult<Option<MovementRecord>> {
    let sql = format!("SELECT {} FROM device_movements WHERE id = ?", MOVEMENT_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(movement_from_row).transpose()
}

/// Mark a record acknowledged; returns false when it already was (or does not exist)
pub async fn acknowledge(
    pool: &SqlitePool,
    id: Uuid,
    reviewer: &str,
    at: DateTime<Utc>,
) -> ReconResult<bool> {
    let id = id.to_string();
    let at = to_db_string(&at);

    let rows_affected = retry_on_lock("movement acknowledge", DEFAULT_MAX_LOCK_WAIT_MS, || async {
        let result = sqlx::query(
            r#"
            UPDATE device_movements
            SET acknowledged = 1, acknowledged_by = ?, acknowledged_at = ?
            WHERE id = ? AND acknowledged = 0
            "#,
        )
        .bind(reviewer)
        .bind(&at)
        .bind(&id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    })
    .await?;

    Ok(rows_affected == 1)
}

/// Unacknowledged records matching `filter`, oldest first
pub async fn list_unacknowledged(
    pool: &SqlitePool,
    filter: &MovementFilter,
) -> ReconResult<Vec<MovementRecord>> {
    let sql = format!(
        r#"
        SELECT {} FROM device_movements
        WHERE acknowledged = 0
          AND (? IS NULL OR manufacturer = ? COLLATE NOCASE)
          AND (? IS NULL OR device_id = ?)
        ORDER BY recorded_at, rowid
        "#,
        MOVEMENT_COLUMNS
    );
    let device_id = filter.device_id.map(|id| id.to_string());

    let rows = sqlx::query(&sql)
        .bind(&filter.manufacturer)
        .bind(&filter.manufacturer)
        .bind(&device_id)
        .bind(&device_id)
        .fetch_all(pool)
        .await?;

    rows.iter().map(movement_from_row).collect()
}

/// Every record for one device, oldest first
pub async fn history(pool: &SqlitePool, device_id: Uuid) -> ReconResult<Vec<MovementRecord>> {
    let sql = format!(
        "SELECT {} FROM device_movements WHERE device_id = ? ORDER BY recorded_at, rowid",
        MOVEMENT_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(device_id.to_string())
        .fetch_all(pool)
        .await?;

    rows.iter().map(movement_from_row).collect()
}

pub async fn count_unacknowledged_for_device(
    pool: &SqlitePool,
    device_id: Uuid,
) -> ReconResult<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM device_movements WHERE device_id = ? AND acknowledged = 0",
    )
    .bind(device_id.to_string())
    .fetch_one(pool)
    .await?;
    Ok(count)
}

fn movement_from_row(row: &SqliteRow) -> ReconResult<MovementRecord> {
    let id: String = row.try_get("id")?;
    let device_id: String = row.try_get("device_id")?;
    let new_ip: String = row.try_get("new_ip")?;
    let recorded_at: String = row.try_get("recorded_at")?;

    Ok(MovementRecord {
        id: parse_uuid(&id, "id")?,
        device_id: parse_uuid(&device_id, "device_id")?,
        manufacturer: row.try_get("manufacturer")?,
        old_ip: parse_column::<IpAddr>(row.try_get("old_ip")?, "old_ip")?,
        new_ip: parse_value(&new_ip, "new_ip")?,
        detected_by: row.try_get("detected_by")?,
        reason: row.try_get("reason")?,
        acknowledged: row.try_get("acknowledged")?,
        acknowledged_by: row.try_get("acknowledged_by")?,
        acknowledged_at: parse_optional_timestamp(row.try_get("acknowledged_at")?, "acknowledged_at")?,
        recorded_at: parse_timestamp(&recorded_at, "recorded_at")?,
    })
}
