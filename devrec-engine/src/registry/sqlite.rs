//! SQLite-backed registry (`devices` table)

use async_trait::async_trait;
use devrec_common::time::to_db_string;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::net::IpAddr;
use uuid::Uuid;

use super::DeviceRegistry;
use crate::db::{movements, parse_column, parse_timestamp, parse_uuid};
use crate::error::{ReconError, ReconResult};
use crate::models::{MacAddress, MovementRecord, RegisteredDevice};
use crate::utils::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

const DEVICE_COLUMNS: &str = "id, manufacturer, serial_number, mac_address, ip, api_device_id, \
     subnet_mask, gateway, model, firmware_version, device_type, metadata, first_seen, last_seen";

/// Registry stored in the shared SQLite database
///
/// Uniqueness is enforced by the partial unique indexes on the table; a
/// violation surfaces as `ReconError::UpsertConflict`. The pool must be the
/// one the movement log writes to: relocations commit the device row and
/// the movement record in one transaction.
#[derive(Debug, Clone)]
pub struct SqliteRegistry {
    db: SqlitePool,
}

impl SqliteRegistry {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn count(&self) -> ReconResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices")
            .fetch_one(&self.db)
            .await?;
        Ok(count)
    }

    /// Every registered device, oldest first
    pub async fn all(&self) -> ReconResult<Vec<RegisteredDevice>> {
        let sql = format!("SELECT {} FROM devices ORDER BY first_seen, id", DEVICE_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.db).await?;
        rows.iter().map(device_from_row).collect()
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        binds: &[&str],
    ) -> ReconResult<Option<RegisteredDevice>> {
        let sql = format!("SELECT {} FROM devices WHERE {} LIMIT 1", DEVICE_COLUMNS, clause);
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        let row = query.fetch_optional(&self.db).await?;
        row.as_ref().map(device_from_row).transpose()
    }
}

#[async_trait]
impl DeviceRegistry for SqliteRegistry {
    async fn find_by_serial(
        &self,
        manufacturer: &str,
        serial: &str,
    ) -> ReconResult<Option<RegisteredDevice>> {
        self.fetch_one_where(
            "serial_number = ? ORDER BY (manufacturer = ? COLLATE NOCASE) DESC, first_seen, id",
            &[serial, manufacturer],
        )
        .await
    }

    async fn find_by_mac(&self, mac: &MacAddress) -> ReconResult<Option<RegisteredDevice>> {
        self.fetch_one_where("mac_address = ?", &[mac.as_str()]).await
    }

    async fn find_by_ip(&self, ip: IpAddr) -> ReconResult<Option<RegisteredDevice>> {
        let ip = ip.to_string();
        self.fetch_one_where("ip = ? ORDER BY last_seen DESC, id DESC", &[ip.as_str()])
            .await
    }

    async fn find_by_api_id(
        &self,
        manufacturer: &str,
        api_id: &str,
    ) -> ReconResult<Option<RegisteredDevice>> {
        self.fetch_one_where(
            "manufacturer = ? COLLATE NOCASE AND api_device_id = ? ORDER BY last_seen DESC, id DESC",
            &[manufacturer, api_id],
        )
        .await
    }

    async fn upsert(&self, device: &RegisteredDevice) -> ReconResult<RegisteredDevice> {
        retry_on_lock("registry upsert", DEFAULT_MAX_LOCK_WAIT_MS, || async {
            let mut conn = self.db.acquire().await?;
            write_device(&mut conn, device).await
        })
        .await?;

        tracing::debug!(device_id = %device.id, "Registry upsert committed");

        Ok(device.clone())
    }

    async fn refresh(&self, device: &RegisteredDevice) -> ReconResult<RegisteredDevice> {
        let id = device.id.to_string();
        let metadata = serde_json::to_string(&device.metadata)?;
        let last_seen = to_db_string(&device.last_seen);
        let updated_at = to_db_string(&devrec_common::time::now());

        let rows_affected = retry_on_lock("registry refresh", DEFAULT_MAX_LOCK_WAIT_MS, || async {
            let result = sqlx::query(
                r#"
                UPDATE devices SET
                    subnet_mask = ?,
                    gateway = ?,
                    model = ?,
                    firmware_version = ?,
                    device_type = ?,
                    metadata = ?,
                    last_seen = MAX(last_seen, ?),
                    updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&device.subnet_mask)
            .bind(&device.gateway)
            .bind(&device.model)
            .bind(&device.firmware_version)
            .bind(&device.device_type)
            .bind(&metadata)
            .bind(&last_seen)
            .bind(&updated_at)
            .bind(&id)
            .execute(&self.db)
            .await?;

            Ok(result.rows_affected())
        })
        .await?;

        if rows_affected == 0 {
            return Err(ReconError::NotFound(format!("device {}", device.id)));
        }

        self.get(device.id)
            .await?
            .ok_or_else(|| ReconError::NotFound(format!("device {}", device.id)))
    }

    async fn upsert_relocated(
        &self,
        device: &RegisteredDevice,
        movement: &MovementRecord,
    ) -> ReconResult<Option<RegisteredDevice>> {
        retry_on_lock("registry relocate", DEFAULT_MAX_LOCK_WAIT_MS, || async {
            let mut tx = self.db.begin().await?;
            write_device(&mut tx, device).await?;
            movements::insert_with(&mut tx, movement).await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;

        tracing::debug!(
            device_id = %device.id,
            movement_id = %movement.id,
            "Registry relocation committed"
        );

        Ok(Some(device.clone()))
    }

    async fn get(&self, id: Uuid) -> ReconResult<Option<RegisteredDevice>> {
        let id = id.to_string();
        self.fetch_one_where("id = ?", &[id.as_str()]).await
    }
}

/// Insert or update the full row of `device`
async fn write_device(conn: &mut SqliteConnection, device: &RegisteredDevice) -> ReconResult<()> {
    let mac = device.mac_address.as_ref().map(|m| m.to_string());
    let ip = device.ip.map(|ip| ip.to_string());
    let metadata = serde_json::to_string(&device.metadata)?;

    sqlx::query(
        r#"
        INSERT INTO devices (
            id, manufacturer, serial_number, mac_address, ip, api_device_id,
            subnet_mask, gateway, model, firmware_version, device_type,
            metadata, first_seen, last_seen, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            manufacturer = excluded.manufacturer,
            serial_number = excluded.serial_number,
            mac_address = excluded.mac_address,
            ip = excluded.ip,
            api_device_id = excluded.api_device_id,
            subnet_mask = excluded.subnet_mask,
            gateway = excluded.gateway,
            model = excluded.model,
            firmware_version = excluded.firmware_version,
            device_type = excluded.device_type,
            metadata = excluded.metadata,
            last_seen = excluded.last_seen,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(device.id.to_string())
    .bind(&device.manufacturer)
    .bind(&device.serial_number)
    .bind(mac)
    .bind(ip)
    .bind(&device.api_device_id)
    .bind(&device.subnet_mask)
    .bind(&device.gateway)
    .bind(&device.model)
    .bind(&device.firmware_version)
    .bind(&device.device_type)
    .bind(metadata)
    .bind(to_db_string(&device.first_seen))
    .bind(to_db_string(&device.last_seen))
    .bind(to_db_string(&devrec_common::time::now()))
    .execute(&mut *conn)
    .await
    .map_err(|err| map_unique_violation(err, device))?;

    Ok(())
}

fn map_unique_violation(err: sqlx::Error, device: &RegisteredDevice) -> ReconError {
    let is_unique = matches!(&err, sqlx::Error::Database(db_err) if db_err.is_unique_violation());
    if is_unique {
        ReconError::UpsertConflict(format!(
            "device {} ({}) collides with an existing device's serial or mac address: {}",
            device.id, device.manufacturer, err
        ))
    } else {
        ReconError::from(err)
    }
}

fn device_from_row(row: &SqliteRow) -> ReconResult<RegisteredDevice> {
    let id: String = row.try_get("id")?;

    let mac: Option<String> = row.try_get("mac_address")?;
    let metadata: String = row.try_get("metadata")?;
    let first_seen: String = row.try_get("first_seen")?;
    let last_seen: String = row.try_get("last_seen")?;

    Ok(RegisteredDevice {
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
        metadata: serde_json::from_str(&metadata)?,
        first_seen: parse_timestamp(&first_seen, "first_seen")?,
        last_seen: parse_timestamp(&last_seen, "last_seen")?,
    })
}
