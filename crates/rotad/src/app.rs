use std::sync::Arc;
use std::time::Duration;

use rota_core::RotaConfig;
use rota_overrides::OverrideManager;
use rota_rotations::{RotationEngine, SqliteRotationStore};
use rota_scheduler::{Notification, RotationTickProcessor, ScheduleIndex};
use rusqlite::Connection;
use tokio::sync::mpsc;
use tracing::info;

/// Every subsystem, each on its own connection to the shared database file.
pub struct App {
    pub config: RotaConfig,
    pub rotations: Arc<RotationEngine>,
    pub overrides: OverrideManager,
    pub index: Arc<ScheduleIndex>,
}

impl App {
    pub fn open(config: RotaConfig) -> anyhow::Result<Self> {
        let db_path = config.database.path.clone();
        let busy = Duration::from_millis(config.database.busy_timeout_ms);
        ensure_parent_dir(&db_path);
        info!(path = %db_path, "opening SQLite database");

        let db = open_conn(&db_path, busy)?;
        db.execute_batch("PRAGMA journal_mode=WAL;")?;

        // run all schema migrations (idempotent)
        rota_rotations::db::init_db(&db)?;
        rota_overrides::db::init_db(&db)?;
        rota_scheduler::db::init_db(&db)?;
        info!("database migrations complete");

        let store = SqliteRotationStore::new(open_conn(&db_path, busy)?);
        Ok(Self {
            rotations: Arc::new(RotationEngine::new(Arc::new(store))),
            overrides: OverrideManager::new(open_conn(&db_path, busy)?),
            index: Arc::new(ScheduleIndex::new(open_conn(&db_path, busy)?)),
            config,
        })
    }

    pub fn tick_processor(
        &self,
        notify_tx: Option<mpsc::Sender<Notification>>,
    ) -> RotationTickProcessor {
        RotationTickProcessor::new(
            self.rotations.clone(),
            self.index.clone(),
            self.config.scheduler.clone(),
            notify_tx,
        )
    }
}

/// Open a connection whose store calls give up after `busy` of lock contention.
fn open_conn(path: &str, busy: Duration) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy)?;
    Ok(conn)
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
