//! Outcome persistence.
//!
//! The monitor reads aggregates, never raw rows: windowed totals, the
//! consecutive-failure counter, and today's usage against the daily quota.
//! [`SqliteOutcomeStore`] is the production implementation;
//! [`MemoryOutcomeStore`] backs tests and short-lived embedded use.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use relay_types::{FailureKind, ProviderId, RequestOutcome};
use rusqlite::{Connection, params};

/// Aggregates over a time window of the outcome log.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowStats {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    /// Mean latency of successful requests, 0 when none succeeded.
    pub avg_latency_ms: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

impl WindowStats {
    /// Failures over total, 0 for an empty window.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.failures as f64 / self.total_requests as f64
    }

    /// Successes over total, 0 for an empty window.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successes as f64 / self.total_requests as f64
    }
}

/// Requests and tokens recorded since UTC midnight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TodayUsage {
    pub requests: u32,
    pub tokens: u64,
}

/// Append-only outcome log with aggregate queries.
pub trait OutcomeStore: Send {
    fn record(&mut self, outcome: &RequestOutcome) -> Result<()>;

    /// Aggregates over outcomes at or after `since`.
    fn window_stats(&self, provider: &ProviderId, since: DateTime<Utc>) -> Result<WindowStats>;

    /// Failures since the last success. Resets to zero on any success.
    fn consecutive_failures(&self, provider: &ProviderId) -> Result<u32>;

    /// Usage since UTC midnight, for quota accounting.
    fn today_usage(&self, provider: &ProviderId) -> Result<TodayUsage>;
}

fn format_ts(ts: DateTime<Utc>) -> String {
    // Fixed-width rendering so string comparison in SQL matches time order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Failed to parse outcome timestamp {raw}"))?
        .with_timezone(&Utc))
}

fn today_start() -> DateTime<Utc> {
    Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map_or_else(Utc::now, |naive| naive.and_utc())
}

/// SQLite-backed outcome store.
pub struct SqliteOutcomeStore {
    db: Connection,
}

impl SqliteOutcomeStore {
    const SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS outcomes (
            id INTEGER PRIMARY KEY,
            provider_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            success INTEGER NOT NULL,
            latency_ms INTEGER NOT NULL,
            tokens_used INTEGER NOT NULL,
            error_kind TEXT
        );

        CREATE TABLE IF NOT EXISTS availability (
            provider_id TEXT PRIMARY KEY,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            last_checked TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_outcomes_provider_ts
        ON outcomes(provider_id, timestamp);
    ";

    /// Open or create the outcome store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create data directory {}", parent.display())
            })?;
        }

        let db = Connection::open(path)
            .with_context(|| format!("Failed to open outcome store at {}", path.display()))?;
        Self::initialize(db)
    }

    /// Open an in-memory outcome store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().context("Failed to open in-memory outcome store")?;
        Self::initialize(db)
    }

    fn initialize(db: Connection) -> Result<Self> {
        db.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;",
        )
        .context("Failed to set outcome store pragmas")?;
        db.execute_batch(Self::SCHEMA)
            .context("Failed to create outcome store schema")?;
        Ok(Self { db })
    }
}

impl OutcomeStore for SqliteOutcomeStore {
    fn record(&mut self, outcome: &RequestOutcome) -> Result<()> {
        let tx = self
            .db
            .transaction()
            .context("Failed to start outcome transaction")?;

        tx.execute(
            "INSERT INTO outcomes
             (provider_id, timestamp, success, latency_ms, tokens_used, error_kind)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                outcome.provider_id.as_str(),
                format_ts(outcome.timestamp),
                i64::from(outcome.success),
                outcome.latency_ms as i64,
                i64::from(outcome.tokens_used),
                outcome.error_kind.map(FailureKind::as_str),
            ],
        )
        .context("Failed to insert outcome")?;

        let now = format_ts(Utc::now());
        if outcome.success {
            tx.execute(
                "INSERT INTO availability (provider_id, consecutive_failures, last_checked)
                 VALUES (?1, 0, ?2)
                 ON CONFLICT(provider_id) DO UPDATE SET
                     consecutive_failures = 0,
                     last_checked = ?2",
                params![outcome.provider_id.as_str(), &now],
            )
        } else {
            tx.execute(
                "INSERT INTO availability (provider_id, consecutive_failures, last_checked)
                 VALUES (?1, 1, ?2)
                 ON CONFLICT(provider_id) DO UPDATE SET
                     consecutive_failures = consecutive_failures + 1,
                     last_checked = ?2",
                params![outcome.provider_id.as_str(), &now],
            )
        }
        .context("Failed to update availability")?;

        tx.commit().context("Failed to commit outcome")?;
        Ok(())
    }

    fn window_stats(&self, provider: &ProviderId, since: DateTime<Utc>) -> Result<WindowStats> {
        let row = self
            .db
            .query_row(
                "SELECT
                     COUNT(*),
                     COALESCE(SUM(success), 0),
                     COALESCE(AVG(CASE WHEN success = 1 THEN latency_ms END), 0),
                     MAX(CASE WHEN success = 1 THEN timestamp END),
                     MAX(CASE WHEN success = 0 THEN timestamp END)
                 FROM outcomes
                 WHERE provider_id = ?1 AND timestamp >= ?2",
                params![provider.as_str(), format_ts(since)],
                |row| {
                    let total: i64 = row.get(0)?;
                    let successes: i64 = row.get(1)?;
                    let avg_latency: f64 = row.get(2)?;
                    let last_success: Option<String> = row.get(3)?;
                    let last_failure: Option<String> = row.get(4)?;
                    Ok((total, successes, avg_latency, last_success, last_failure))
                },
            )
            .context("Failed to query window stats")?;

        let (total, successes, avg_latency, last_success, last_failure) = row;
        Ok(WindowStats {
            total_requests: total as u64,
            successes: successes as u64,
            failures: (total - successes) as u64,
            avg_latency_ms: avg_latency,
            last_success: last_success.as_deref().map(parse_ts).transpose()?,
            last_failure: last_failure.as_deref().map(parse_ts).transpose()?,
        })
    }

    fn consecutive_failures(&self, provider: &ProviderId) -> Result<u32> {
        let count: i64 = self
            .db
            .query_row(
                "SELECT COALESCE(
                     (SELECT consecutive_failures FROM availability WHERE provider_id = ?1),
                     0
                 )",
                [provider.as_str()],
                |row| row.get(0),
            )
            .context("Failed to query consecutive failures")?;
        Ok(count as u32)
    }

    fn today_usage(&self, provider: &ProviderId) -> Result<TodayUsage> {
        let (requests, tokens): (i64, i64) = self
            .db
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(tokens_used), 0)
                 FROM outcomes
                 WHERE provider_id = ?1 AND timestamp >= ?2",
                params![provider.as_str(), format_ts(today_start())],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to query today usage")?;

        Ok(TodayUsage {
            requests: requests as u32,
            tokens: tokens as u64,
        })
    }
}

/// In-memory outcome store for tests.
#[derive(Debug, Default)]
pub struct MemoryOutcomeStore {
    outcomes: Vec<RequestOutcome>,
    consecutive: HashMap<ProviderId, u32>,
}

impl MemoryOutcomeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutcomeStore for MemoryOutcomeStore {
    fn record(&mut self, outcome: &RequestOutcome) -> Result<()> {
        let counter = self.consecutive.entry(outcome.provider_id.clone()).or_default();
        if outcome.success {
            *counter = 0;
        } else {
            *counter += 1;
        }
        self.outcomes.push(outcome.clone());
        Ok(())
    }

    fn window_stats(&self, provider: &ProviderId, since: DateTime<Utc>) -> Result<WindowStats> {
        let mut stats = WindowStats::default();
        let mut latency_sum = 0u64;

        for outcome in self
            .outcomes
            .iter()
            .filter(|o| &o.provider_id == provider && o.timestamp >= since)
        {
            stats.total_requests += 1;
            if outcome.success {
                stats.successes += 1;
                latency_sum += outcome.latency_ms;
                stats.last_success = stats.last_success.max(Some(outcome.timestamp));
            } else {
                stats.failures += 1;
                stats.last_failure = stats.last_failure.max(Some(outcome.timestamp));
            }
        }

        if stats.successes > 0 {
            stats.avg_latency_ms = latency_sum as f64 / stats.successes as f64;
        }
        Ok(stats)
    }

    fn consecutive_failures(&self, provider: &ProviderId) -> Result<u32> {
        Ok(self.consecutive.get(provider).copied().unwrap_or(0))
    }

    fn today_usage(&self, provider: &ProviderId) -> Result<TodayUsage> {
        let start = today_start();
        let mut usage = TodayUsage::default();
        for outcome in self
            .outcomes
            .iter()
            .filter(|o| &o.provider_id == provider && o.timestamp >= start)
        {
            usage.requests += 1;
            usage.tokens += u64::from(outcome.tokens_used);
        }
        Ok(usage)
    }
}
