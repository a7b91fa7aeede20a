//! Database Test Utilities

use std::sync::Arc;

use anyhow::Result;
use devrec_common::config::ReconcileConfig;
use devrec_common::db::init_database;
use devrec_common::EventBus;
use devrec_engine::{DeviceRegistry, DiscoveryQueue, MovementLog, Reconciler, SqliteRegistry};
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Create a temporary database with the schema applied
///
/// Returns (TempDir, SqlitePool) - TempDir must be kept alive for duration of test
pub async fn create_test_db() -> Result<(TempDir, SqlitePool)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test_devrec.db");
    let pool = init_database(&db_path).await?;
    Ok((temp_dir, pool))
}

/// A reconciler over a fresh SQLite database
pub struct TestEnv {
    _temp_dir: TempDir,
    pub db: SqlitePool,
    pub registry: Arc<SqliteRegistry>,
    pub events: EventBus,
    pub reconciler: Arc<Reconciler>,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_settings(ReconcileConfig::default()).await
    }

    pub async fn with_settings(settings: ReconcileConfig) -> Self {
        Self::build(settings, |sqlite| sqlite as Arc<dyn DeviceRegistry>).await
    }

    /// Reconciler that reaches the SQLite registry through `wrap`
    ///
    /// `registry` stays the unwrapped store for seeding and assertions.
    pub async fn wrapping<F>(wrap: F) -> Self
    where
        F: FnOnce(Arc<SqliteRegistry>) -> Arc<dyn DeviceRegistry>,
    {
        Self::build(ReconcileConfig::default(), wrap).await
    }

    async fn build<F>(settings: ReconcileConfig, wrap: F) -> Self
    where
        F: FnOnce(Arc<SqliteRegistry>) -> Arc<dyn DeviceRegistry>,
    {
        let (temp_dir, db) = create_test_db().await.expect("test database");
        let registry = Arc::new(SqliteRegistry::new(db.clone()));
        let events = EventBus::new(64);
        let reconciler = Arc::new(Reconciler::new(
            db.clone(),
            wrap(registry.clone()),
            events.clone(),
            settings,
        ));

        Self {
            _temp_dir: temp_dir,
            db,
            registry,
            events,
            reconciler,
        }
    }

    pub fn queue(&self) -> &DiscoveryQueue {
        self.reconciler.queue()
    }

    pub fn movements(&self) -> &MovementLog {
        self.reconciler.movement_log()
    }
}
