//! Database initialization
//!
//! Opens (or creates) the SQLite database and applies the schema. Every
//! statement is idempotent, so initialization runs on each startup.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Current schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// SQLite busy timeout applied to every pooled connection
const BUSY_TIMEOUT_MS: u64 = 5000;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // WAL allows concurrent readers alongside the single writer
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create every table and index (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_devices_table(pool).await?;
    create_discovery_queue_table(pool).await?;
    create_device_movements_table(pool).await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the devices table (the registry)
///
/// (manufacturer, serial_number) and mac_address are unique when present.
pub async fn create_devices_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS devices (
            id TEXT PRIMARY KEY,
            manufacturer TEXT NOT NULL,
            serial_number TEXT,
            mac_address TEXT,
            ip TEXT,
            api_device_id TEXT,
            subnet_mask TEXT,
            gateway TEXT,
            model TEXT,
            firmware_version TEXT,
            device_type TEXT,
            metadata TEXT NOT NULL DEFAULT '{}',
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_manufacturer_serial
            ON devices (manufacturer COLLATE NOCASE, serial_number)
            WHERE serial_number IS NOT NULL
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_mac
            ON devices (mac_address)
            WHERE mac_address IS NOT NULL
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_devices_serial ON devices (serial_number)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_devices_ip ON devices (ip)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_devices_api_id
            ON devices (manufacturer COLLATE NOCASE, api_device_id)
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the discovery queue table
///
/// At most one open (pending or approved) entry exists per identity key and
/// classification; repeated sightings refresh that entry.
pub async fn create_discovery_queue_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS discovery_queue (
            id TEXT PRIMARY KEY,
            manufacturer TEXT NOT NULL,
            serial_number TEXT,
            mac_address TEXT,
            ip TEXT,
            api_device_id TEXT,
            subnet_mask TEXT,
            gateway TEXT,
            model TEXT,
            firmware_version TEXT,
            device_type TEXT,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'approved', 'rejected', 'imported', 'duplicate')),
            classification TEXT NOT NULL,
            reason TEXT NOT NULL,
            is_ip_conflict INTEGER NOT NULL DEFAULT 0,
            is_manufacturer_mismatch INTEGER NOT NULL DEFAULT 0,
            existing_device_id TEXT,
            imported_device_id TEXT,
            identity_key TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            observed_at TEXT NOT NULL,
            discovered_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            sighting_count INTEGER NOT NULL DEFAULT 1,
            reviewed_by TEXT,
            reviewed_at TEXT,
            last_error TEXT,
            revision INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_discovery_queue_open_identity
            ON discovery_queue (identity_key, classification)
            WHERE status IN ('pending', 'approved')
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_discovery_queue_status ON discovery_queue (status, discovered_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the append-only device movement log
pub async fn create_device_movements_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS device_movements (
            id TEXT PRIMARY KEY,
            device_id TEXT NOT NULL,
            manufacturer TEXT NOT NULL,
            old_ip TEXT,
            new_ip TEXT NOT NULL,
            detected_by TEXT NOT NULL,
            reason TEXT NOT NULL,
            acknowledged INTEGER NOT NULL DEFAULT 0,
            acknowledged_by TEXT,
            acknowledged_at TEXT,
            recorded_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_device_movements_device ON device_movements (device_id, recorded_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_device_movements_unacknowledged ON device_movements (acknowledged, recorded_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
