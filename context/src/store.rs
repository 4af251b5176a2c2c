//! SQLite-backed snapshot and integrity-check log.
//!
//! Snapshots persist so a hibernated session can be restored after a
//! process restart; integrity checks persist so pass/fail statistics
//! survive across sessions.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::snapshot::{ContextSnapshot, Verdict};

/// Aggregate pass/fail counts over the integrity log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntegrityStats {
    pub total_checks: u64,
    pub passed: u64,
    pub failed: u64,
}

impl IntegrityStats {
    /// Percentage of checks that passed, 0 when no checks exist.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_checks == 0 {
            return 0.0;
        }
        self.passed as f64 / self.total_checks as f64 * 100.0
    }
}

/// One logged integrity check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityCheck {
    pub snapshot_id: String,
    pub valid: bool,
    pub message: String,
    pub created_at: String,
}

/// Persistent store for context snapshots and integrity checks.
pub struct IntegrityStore {
    db: Connection,
}

impl IntegrityStore {
    const SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS snapshots (
            id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL,
            total_tokens INTEGER NOT NULL,
            checksum TEXT NOT NULL,
            elements TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS integrity_checks (
            id INTEGER PRIMARY KEY,
            snapshot_id TEXT NOT NULL,
            valid INTEGER NOT NULL,
            message TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_integrity_checks_snapshot
        ON integrity_checks(snapshot_id);
    ";

    /// Open or create the integrity store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create data directory {}", parent.display())
            })?;
        }

        let db = Connection::open(path)
            .with_context(|| format!("Failed to open integrity store at {}", path.display()))?;
        Self::initialize(db)
    }

    /// Open an in-memory integrity store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let db =
            Connection::open_in_memory().context("Failed to open in-memory integrity store")?;
        Self::initialize(db)
    }

    fn initialize(db: Connection) -> Result<Self> {
        db.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;",
        )
        .context("Failed to set integrity store pragmas")?;
        db.execute_batch(Self::SCHEMA)
            .context("Failed to create integrity store schema")?;
        Ok(Self { db })
    }

    /// Persist a snapshot. Re-recording the same id replaces the row.
    pub fn record_snapshot(&mut self, snapshot: &ContextSnapshot) -> Result<()> {
        let elements = serde_json::to_string(&snapshot.elements)
            .context("Failed to serialize snapshot elements")?;
        self.db
            .execute(
                "INSERT OR REPLACE INTO snapshots (id, created_at, total_tokens, checksum, elements)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    &snapshot.id,
                    snapshot.timestamp.to_rfc3339(),
                    i64::from(snapshot.total_tokens),
                    &snapshot.checksum,
                    &elements,
                ],
            )
            .context("Failed to insert snapshot")?;
        Ok(())
    }

    /// Load a snapshot by id.
    pub fn load_snapshot(&self, id: &str) -> Result<Option<ContextSnapshot>> {
        let row = self
            .db
            .query_row(
                "SELECT created_at, total_tokens, checksum, elements
                 FROM snapshots WHERE id = ?1",
                [id],
                |row| {
                    let created_at: String = row.get(0)?;
                    let total_tokens: i64 = row.get(1)?;
                    let checksum: String = row.get(2)?;
                    let elements: String = row.get(3)?;
                    Ok((created_at, total_tokens, checksum, elements))
                },
            )
            .optional()
            .context("Failed to query snapshot")?;

        let Some((created_at, total_tokens, checksum, elements)) = row else {
            return Ok(None);
        };

        let timestamp = chrono::DateTime::parse_from_rfc3339(&created_at)
            .context("Failed to parse snapshot timestamp")?
            .with_timezone(&Utc);
        let elements =
            serde_json::from_str(&elements).context("Failed to deserialize snapshot elements")?;

        Ok(Some(ContextSnapshot {
            id: id.to_string(),
            timestamp,
            elements,
            total_tokens: total_tokens as u32,
            checksum,
        }))
    }

    /// Append an integrity check to the log.
    pub fn record_check(&mut self, snapshot_id: &str, verdict: &Verdict) -> Result<()> {
        let message = verdict.reason().unwrap_or("integrity validated");
        self.db
            .execute(
                "INSERT INTO integrity_checks (snapshot_id, valid, message, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    snapshot_id,
                    i64::from(verdict.passed()),
                    message,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to insert integrity check")?;
        Ok(())
    }

    /// Pass/fail statistics over the whole log.
    pub fn stats(&self) -> Result<IntegrityStats> {
        let (total, passed): (i64, i64) = self
            .db
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(valid), 0) FROM integrity_checks",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to query integrity stats")?;

        Ok(IntegrityStats {
            total_checks: total as u64,
            passed: passed as u64,
            failed: (total - passed) as u64,
        })
    }

    /// Most recent checks, newest first.
    pub fn recent_checks(&self, limit: usize) -> Result<Vec<IntegrityCheck>> {
        let mut stmt = self
            .db
            .prepare(
                "SELECT snapshot_id, valid, message, created_at
                 FROM integrity_checks
                 ORDER BY id DESC
                 LIMIT ?1",
            )
            .context("Failed to prepare recent checks query")?;

        let checks: Vec<IntegrityCheck> = stmt
            .query_map([limit as i64], |row| {
                Ok(IntegrityCheck {
                    snapshot_id: row.get(0)?,
                    valid: row.get::<_, i64>(1)? != 0,
                    message: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .context("Failed to query recent checks")?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(checks)
    }
}
