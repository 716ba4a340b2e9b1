use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::ScanJob;

/// One JSON record per scan id; the latest write for an id wins.
pub struct SqliteScanStore {
    conn: Mutex<Connection>,
}

impl SqliteScanStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!(path = %path.display(), "scan store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS scans (
              id TEXT PRIMARY KEY NOT NULL,
              created_at TEXT NOT NULL,
              record TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    pub fn save(&self, job: &ScanJob) -> Result<()> {
        let record = serde_json::to_string(job)?;
        self.conn().execute(
            r#"
            INSERT INTO scans (id, created_at, record) VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
              created_at=excluded.created_at,
              record=excluded.record
            "#,
            params![job.id, job.created_at.to_rfc3339(), record],
        )?;
        Ok(())
    }

    /// Every record that still deserializes, oldest first.
    pub fn load_all(&self) -> Result<Vec<ScanJob>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, record FROM scans ORDER BY created_at ASC")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;

        let mut jobs = Vec::new();
        for row in rows {
            let (id, record) = row?;
            match serde_json::from_str::<ScanJob>(&record) {
                Ok(job) => jobs.push(job),
                Err(err) => warn!(scan_id = %id, error = %err, "skipping unreadable scan record"),
            }
        }
        Ok(jobs)
    }
}
