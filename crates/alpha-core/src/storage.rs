//! Checkpoint ledger: one row per generation, enough to resume a run
//! without re-evaluating already-scored individuals.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One persisted generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRow {
    pub generation: u64,
    /// Serialized population (strategy snapshots with fitness).
    pub population_json: String,
    pub diversity: f64,
    /// Serialized tier-selector thresholds and learner state.
    pub thresholds_json: String,
    pub restarts_used: u64,
    pub created_at: String,
}

/// SQLite-backed run ledger.
pub struct RunLedger {
    db_path: PathBuf,
}

impl RunLedger {
    pub fn new(db_path: impl AsRef<Path>, run_name: Option<&str>) -> Result<Self> {
        let mut path = db_path.as_ref().to_path_buf();

        // Run-isolated databases keep concurrent runs from clobbering
        // each other's checkpoints.
        if let Some(name) = run_name {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy())
                .unwrap_or_default();
            path.set_file_name(format!("{}_{}.sqlite", stem, name));
        }

        let ledger = Self { db_path: path };
        ledger.init_db()?;
        Ok(ledger)
    }

    fn open(&self) -> Result<rusqlite::Connection> {
        match rusqlite::Connection::open(&self.db_path) {
            Ok(c) => Ok(c),
            Err(e) => {
                let msg = e.to_string().to_lowercase();
                if msg.contains("disk i/o") || msg.contains("disk io") {
                    warn!("Disk I/O error detected, removing WAL/SHM files and retrying");
                    let _ = std::fs::remove_file(self.db_path.with_extension("sqlite-wal"));
                    let _ = std::fs::remove_file(self.db_path.with_extension("sqlite-shm"));
                    Ok(rusqlite::Connection::open(&self.db_path)?)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    fn init_db(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = self.open()?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA wal_autocheckpoint=1000;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                generation INTEGER PRIMARY KEY,
                population TEXT NOT NULL,
                diversity REAL,
                thresholds TEXT,
                restarts_used INTEGER DEFAULT 0,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS run_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT,
                timestamp TEXT NOT NULL,
                category TEXT,
                message TEXT,
                severity TEXT,
                context TEXT
            )",
            [],
        )?;

        debug!("Checkpoint database initialized at {:?}", self.db_path);
        Ok(())
    }

    pub fn save_checkpoint(
        &self,
        generation: u64,
        population_json: &str,
        diversity: f64,
        thresholds_json: &str,
        restarts_used: u64,
    ) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT OR REPLACE INTO checkpoints
            (generation, population, diversity, thresholds, restarts_used, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, CURRENT_TIMESTAMP)",
            rusqlite::params![
                generation as i64,
                population_json,
                diversity,
                thresholds_json,
                restarts_used as i64
            ],
        )
        .context("Failed to save checkpoint")?;

        info!("Saved checkpoint for generation {}", generation);
        Ok(())
    }

    pub fn load_checkpoint(&self, generation: u64) -> Result<Option<CheckpointRow>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT generation, population, diversity, thresholds, restarts_used, created_at
             FROM checkpoints WHERE generation = ?1",
        )?;
        let mut rows = stmt.query(rusqlite::params![generation as i64])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_checkpoint(row)?)),
            None => Ok(None),
        }
    }

    pub fn load_latest_checkpoint(&self) -> Result<Option<CheckpointRow>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT generation, population, diversity, thresholds, restarts_used, created_at
             FROM checkpoints ORDER BY generation DESC LIMIT 1",
        )?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_checkpoint(row)?)),
            None => Ok(None),
        }
    }

    pub fn checkpoint_count(&self) -> Result<usize> {
        let conn = self.open()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM checkpoints", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    pub fn log_event(&self, event: &crate::events::RunEvent) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO run_events (event_id, timestamp, category, message, severity, context)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                event.event_id,
                event.timestamp.to_rfc3339(),
                event.category,
                event.message,
                event.severity,
                event.context.to_string()
            ],
        )?;
        Ok(())
    }
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> Result<CheckpointRow> {
    Ok(CheckpointRow {
        generation: row.get::<_, i64>(0)? as u64,
        population_json: row.get(1)?,
        diversity: row.get(2)?,
        thresholds_json: row.get(3)?,
        restarts_used: row.get::<_, i64>(4)? as u64,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = RunLedger::new(dir.path().join("ckpt.sqlite"), Some("test")).unwrap();

        ledger
            .save_checkpoint(0, r#"{"individuals":[]}"#, 0.5, r#"{"t1":0.3,"t2":0.7}"#, 0)
            .unwrap();
        ledger
            .save_checkpoint(1, r#"{"individuals":[1]}"#, 0.4, r#"{"t1":0.32,"t2":0.7}"#, 1)
            .unwrap();

        assert_eq!(ledger.checkpoint_count().unwrap(), 2);

        let latest = ledger.load_latest_checkpoint().unwrap().unwrap();
        assert_eq!(latest.generation, 1);
        assert_eq!(latest.restarts_used, 1);
        assert!((latest.diversity - 0.4).abs() < 1e-12);

        let first = ledger.load_checkpoint(0).unwrap().unwrap();
        assert_eq!(first.population_json, r#"{"individuals":[]}"#);

        assert!(ledger.load_checkpoint(99).unwrap().is_none());
    }

    #[test]
    fn save_is_idempotent_per_generation() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = RunLedger::new(dir.path().join("ckpt.sqlite"), None).unwrap();
        ledger.save_checkpoint(3, "a", 0.1, "{}", 0).unwrap();
        ledger.save_checkpoint(3, "b", 0.2, "{}", 0).unwrap();
        assert_eq!(ledger.checkpoint_count().unwrap(), 1);
        let row = ledger.load_checkpoint(3).unwrap().unwrap();
        assert_eq!(row.population_json, "b");
    }
}
