//! Hibernation bridge.
//!
//! When every provider is excluded, failure-capped, or quota-exhausted,
//! the bridge preserves the full conversation state and waits. It polls
//! availability through the selector without issuing completions, and on
//! recovery injects a provider-agnostic prompt so any backend can resume
//! the conversation without having seen it.
//!
//! State machine: `Inactive -> Activated -> Recovering -> Restored`, with
//! a failed recovery returning to `Activated`. Transitions are checked
//! against [`BridgeState::can_transition_to`] before they are persisted.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use relay_context::MemorySections;
use relay_monitor::{OutcomeStore, ProviderSelector, Selection};
use relay_types::{BridgePolicy, BridgeState, ProviderId, RelayError, SessionId};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::watch;
use uuid::Uuid;

/// Action keywords mapped to the intent line of the recovery prompt.
const INTENT_KEYWORDS: [(&str, &str); 10] = [
    ("implement", "implementing functionality"),
    ("build", "building a feature"),
    ("fix", "fixing an issue"),
    ("debug", "debugging a problem"),
    ("explain", "seeking an explanation"),
    ("help", "requesting assistance"),
    ("create", "creating a new component"),
    ("optimize", "optimizing performance"),
    ("refactor", "refactoring code"),
    ("test", "testing an implementation"),
];

/// Reset windows shorter than this are treated as the recovery estimate.
const RESET_HORIZON_SECS: u64 = 3_600;

/// One hibernation episode.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeSession {
    pub id: SessionId,
    pub state: BridgeState,
    pub activated_at: DateTime<Utc>,
    /// The request that could not be served when the bridge activated.
    pub pending_input: String,
    /// Snapshot persisted at activation; recovery validates against it.
    pub snapshot_id: String,
    pub snapshot_checksum: String,
    pub sections: MemorySections,
    pub user_intent: String,
    pub exhausted_providers: Vec<ProviderId>,
    pub expected_recovery_secs: u64,
    pub recovery_attempts: u32,
}

impl BridgeSession {
    #[must_use]
    pub fn elapsed_secs(&self) -> u64 {
        (Utc::now() - self.activated_at).num_seconds().max(0) as u64
    }

    /// Self-contained recovery prompt any provider can act on.
    #[must_use]
    pub fn recovery_prompt(&self) -> String {
        let project = if self.sections.project.is_empty() {
            "General development discussion"
        } else {
            &self.sections.project
        };
        let technical = if self.sections.technical.is_empty() {
            "No specific technical context"
        } else {
            &self.sections.technical
        };
        let flow = if self.sections.flow.is_empty() {
            "No previous conversation"
        } else {
            &self.sections.flow
        };

        [
            "=== CONTEXT_RECOVERY ===",
            "",
            "SITUATION: The previous session was interrupted by a temporary service gap.",
            "YOUR TASK: Continue the conversation seamlessly. The user expects no awareness of the interruption.",
            "",
            "PROJECT_CONTEXT:",
            project,
            "",
            "TECHNICAL_CONTEXT:",
            technical,
            "",
            "USER_INTENT:",
            &self.user_intent,
            "",
            "RECENT_DISCUSSION:",
            flow,
            "",
            "CURRENT_REQUEST:",
            &format!("\"{}\"", self.pending_input),
            "",
            "INSTRUCTION:",
            "Respond to the current request as a natural continuation.",
            "Reference previous discussion points naturally.",
            "Do not mention the interruption, recovery, or any technical issues.",
            "",
            "=== END_RECOVERY ===",
            "",
            &format!("User: {}", self.pending_input),
        ]
        .join("\n")
    }

    fn transition(&mut self, next: BridgeState) -> Result<(), RelayError> {
        if !self.state.can_transition_to(next) {
            return Err(RelayError::InvalidBridgeTransition {
                from: self.state.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.state = next;
        Ok(())
    }
}

fn extract_user_intent(prompt: &str) -> String {
    let lowered = prompt.to_lowercase();
    let excerpt: String = prompt.chars().take(100).collect();
    for (keyword, intent) in INTENT_KEYWORDS {
        if lowered.contains(keyword) {
            return format!("User is {intent}: {excerpt}");
        }
    }
    format!("User requesting: {excerpt}")
}

/// Seconds until recovery is plausible.
///
/// Daily quotas reset at UTC midnight; when the reset is within the
/// horizon it is the estimate, otherwise a conservative rolling-window
/// guess applies.
fn estimate_recovery_secs(policy: &BridgePolicy, now: DateTime<Utc>) -> u64 {
    let next_midnight = now
        .date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc());

    if let Some(reset) = next_midnight {
        let to_reset = (reset - now).num_seconds().max(0) as u64;
        if to_reset < RESET_HORIZON_SECS {
            return to_reset;
        }
    }
    policy.recovery_estimate_secs
}

/// Aggregate statistics over all hibernation episodes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BridgeStats {
    pub total_activations: u64,
    pub successful_recoveries: u64,
    pub avg_recovery_secs: f64,
    pub max_recovery_secs: u64,
}

impl BridgeStats {
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_activations == 0 {
            return 0.0;
        }
        self.successful_recoveries as f64 / self.total_activations as f64 * 100.0
    }
}

/// Result of one availability poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgePoll {
    ProviderAvailable(ProviderId),
    StillExhausted {
        elapsed_secs: u64,
        next_check_secs: u64,
    },
}

/// How a monitoring wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeResolution {
    ProviderAvailable(ProviderId),
    /// Shutdown was signalled; the session stays consistent for a later
    /// resume.
    Cancelled,
}

/// SQLite persistence for bridge sessions.
pub struct BridgeStore {
    db: Connection,
}

impl BridgeStore {
    const SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS bridge_sessions (
            id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            activated_at TEXT NOT NULL,
            recovered_at TEXT,
            duration_secs INTEGER,
            pending_input TEXT NOT NULL,
            snapshot_id TEXT NOT NULL,
            snapshot_checksum TEXT NOT NULL,
            sections TEXT NOT NULL,
            user_intent TEXT NOT NULL,
            exhausted_providers TEXT NOT NULL,
            expected_recovery_secs INTEGER NOT NULL,
            recovery_attempts INTEGER NOT NULL DEFAULT 0,
            successful INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_bridge_sessions_activated
        ON bridge_sessions(activated_at);
    ";

    /// Open or create the bridge store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create data directory {}", parent.display())
            })?;
        }

        let db = Connection::open(path)
            .with_context(|| format!("Failed to open bridge store at {}", path.display()))?;
        Self::initialize(db)
    }

    /// Open an in-memory bridge store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().context("Failed to open in-memory bridge store")?;
        Self::initialize(db)
    }

    fn initialize(db: Connection) -> Result<Self> {
        db.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;",
        )
        .context("Failed to set bridge store pragmas")?;
        db.execute_batch(Self::SCHEMA)
            .context("Failed to create bridge store schema")?;
        Ok(Self { db })
    }

    fn insert(&mut self, session: &BridgeSession) -> Result<()> {
        let sections = serde_json::to_string(&session.sections)
            .context("Failed to serialize bridge sections")?;
        let exhausted = serde_json::to_string(&session.exhausted_providers)
            .context("Failed to serialize exhausted providers")?;

        self.db
            .execute(
                "INSERT INTO bridge_sessions
                 (id, state, activated_at, pending_input, snapshot_id, snapshot_checksum,
                  sections, user_intent, exhausted_providers, expected_recovery_secs,
                  recovery_attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    session.id.as_str(),
                    session.state.as_str(),
                    session.activated_at.to_rfc3339(),
                    &session.pending_input,
                    &session.snapshot_id,
                    &session.snapshot_checksum,
                    &sections,
                    &session.user_intent,
                    &exhausted,
                    session.expected_recovery_secs as i64,
                    i64::from(session.recovery_attempts),
                ],
            )
            .context("Failed to insert bridge session")?;
        Ok(())
    }

    fn update_state(&mut self, session: &BridgeSession) -> Result<()> {
        self.db
            .execute(
                "UPDATE bridge_sessions
                 SET state = ?1, recovery_attempts = ?2
                 WHERE id = ?3",
                params![
                    session.state.as_str(),
                    i64::from(session.recovery_attempts),
                    session.id.as_str(),
                ],
            )
            .context("Failed to update bridge session state")?;
        Ok(())
    }

    fn mark_restored(&mut self, session: &BridgeSession) -> Result<()> {
        self.db
            .execute(
                "UPDATE bridge_sessions
                 SET state = ?1, recovered_at = ?2, duration_secs = ?3, successful = 1
                 WHERE id = ?4",
                params![
                    BridgeState::Restored.as_str(),
                    Utc::now().to_rfc3339(),
                    session.elapsed_secs() as i64,
                    session.id.as_str(),
                ],
            )
            .context("Failed to mark bridge session restored")?;
        Ok(())
    }

    /// Most recent non-terminal session, if any survived a restart.
    pub fn active_session(&self) -> Result<Option<BridgeSession>> {
        let row = self
            .db
            .query_row(
                "SELECT id, state, activated_at, pending_input, snapshot_id,
                        snapshot_checksum, sections, user_intent, exhausted_providers,
                        expected_recovery_secs, recovery_attempts
                 FROM bridge_sessions
                 WHERE state IN ('activated', 'recovering')
                 ORDER BY activated_at DESC
                 LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, i64>(9)?,
                        row.get::<_, i64>(10)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query active bridge session")?;

        let Some((
            id,
            state,
            activated_at,
            pending_input,
            snapshot_id,
            snapshot_checksum,
            sections,
            user_intent,
            exhausted,
            expected_recovery_secs,
            recovery_attempts,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(BridgeSession {
            id: SessionId::new(id),
            state: BridgeState::parse(&state).context("Unknown persisted bridge state")?,
            activated_at: DateTime::parse_from_rfc3339(&activated_at)
                .context("Failed to parse bridge activation timestamp")?
                .with_timezone(&Utc),
            pending_input,
            snapshot_id,
            snapshot_checksum,
            sections: serde_json::from_str(&sections)
                .context("Failed to deserialize bridge sections")?,
            user_intent,
            exhausted_providers: serde_json::from_str(&exhausted)
                .context("Failed to deserialize exhausted providers")?,
            expected_recovery_secs: expected_recovery_secs as u64,
            recovery_attempts: recovery_attempts as u32,
        }))
    }

    /// Aggregate statistics over all sessions.
    pub fn stats(&self) -> Result<BridgeStats> {
        let (total, successful, avg, max): (i64, i64, f64, i64) = self
            .db
            .query_row(
                "SELECT
                     COUNT(*),
                     COALESCE(SUM(successful), 0),
                     COALESCE(AVG(CASE WHEN successful = 1 THEN duration_secs END), 0),
                     COALESCE(MAX(duration_secs), 0)
                 FROM bridge_sessions",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .context("Failed to query bridge stats")?;

        Ok(BridgeStats {
            total_activations: total as u64,
            successful_recoveries: successful as u64,
            avg_recovery_secs: avg,
            max_recovery_secs: max as u64,
        })
    }
}

/// Preserves context across total provider exhaustion and restores it.
pub struct HibernationBridge {
    policy: BridgePolicy,
    store: BridgeStore,
    active: Option<BridgeSession>,
}

impl HibernationBridge {
    pub fn new(policy: BridgePolicy, store: BridgeStore) -> Result<Self> {
        // Pick up a session that survived a restart.
        let active = store.active_session()?;
        if let Some(session) = &active {
            tracing::info!(
                session = %session.id,
                state = %session.state,
                "resuming persisted bridge session"
            );
        }
        Ok(Self {
            policy,
            store,
            active,
        })
    }

    #[must_use]
    pub fn active(&self) -> Option<&BridgeSession> {
        self.active.as_ref()
    }

    #[must_use]
    pub const fn policy(&self) -> &BridgePolicy {
        &self.policy
    }

    /// Activates the bridge, preserving the pending request and context.
    pub fn activate(
        &mut self,
        pending_input: &str,
        sections: MemorySections,
        snapshot_id: &str,
        snapshot_checksum: &str,
        exhausted_providers: Vec<ProviderId>,
    ) -> Result<&BridgeSession> {
        let now = Utc::now();
        let mut session = BridgeSession {
            id: SessionId::new(format!("bridge-{}", Uuid::new_v4())),
            state: BridgeState::Inactive,
            activated_at: now,
            pending_input: pending_input.to_string(),
            snapshot_id: snapshot_id.to_string(),
            snapshot_checksum: snapshot_checksum.to_string(),
            user_intent: extract_user_intent(pending_input),
            sections,
            exhausted_providers,
            expected_recovery_secs: estimate_recovery_secs(&self.policy, now),
            recovery_attempts: 0,
        };
        session.transition(BridgeState::Activated)?;

        tracing::warn!(
            session = %session.id,
            exhausted = session.exhausted_providers.len(),
            expected_recovery_secs = session.expected_recovery_secs,
            "hibernation bridge activated"
        );
        self.store.insert(&session)?;
        Ok(&*self.active.insert(session))
    }

    /// Fails with [`RelayError::BridgeTimeout`] once the session exceeds
    /// its maximum lifetime. The preserved snapshot stays in the store.
    pub fn check_timeout(&self) -> Result<(), RelayError> {
        if let Some(session) = &self.active {
            let elapsed = session.elapsed_secs();
            if elapsed > self.policy.max_duration_secs {
                return Err(RelayError::BridgeTimeout {
                    elapsed_secs: elapsed,
                });
            }
        }
        Ok(())
    }

    /// One availability check through the selector. Issues no completions.
    pub fn poll<S: OutcomeStore>(
        &mut self,
        selector: &mut ProviderSelector<S>,
    ) -> Result<BridgePoll> {
        self.check_timeout()?;
        let session = self
            .active
            .as_ref()
            .context("no active bridge session to poll")?;

        match selector.select(&[], false)? {
            Selection::Provider(id) => Ok(BridgePoll::ProviderAvailable(id)),
            Selection::NoneAvailable => Ok(BridgePoll::StillExhausted {
                elapsed_secs: session.elapsed_secs(),
                next_check_secs: self.policy.check_interval_secs,
            }),
        }
    }

    /// Polls on the configured interval until a provider is available,
    /// shutdown is signalled, or the maximum lifetime is exceeded.
    ///
    /// Cancellation leaves the session consistent: it stays `Activated`
    /// and persisted, ready for a later poll or process restart.
    pub async fn wait_for_provider<S: OutcomeStore>(
        &mut self,
        selector: &mut ProviderSelector<S>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<BridgeResolution> {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.policy.check_interval_secs));
        // The first tick fires immediately; that is the activation-time poll.
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.poll(selector)? {
                        BridgePoll::ProviderAvailable(id) => {
                            tracing::info!(provider = %id, "provider available, bridge can recover");
                            return Ok(BridgeResolution::ProviderAvailable(id));
                        }
                        BridgePoll::StillExhausted { elapsed_secs, .. } => {
                            tracing::debug!(elapsed_secs, "all providers still exhausted");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("bridge monitoring cancelled");
                        return Ok(BridgeResolution::Cancelled);
                    }
                }
            }
        }
    }

    /// Transitions to `Recovering` and returns the recovery prompt.
    pub fn begin_recovery(&mut self) -> Result<String> {
        let session = self
            .active
            .as_mut()
            .context("no active bridge session to recover")?;
        session.transition(BridgeState::Recovering)?;
        session.recovery_attempts += 1;
        let prompt = session.recovery_prompt();
        self.store.update_state(session)?;
        Ok(prompt)
    }

    /// Finishes a recovery attempt: `Restored` on success, back to
    /// `Activated` on failure.
    pub fn complete_recovery(&mut self, success: bool) -> Result<BridgeState> {
        let session = self
            .active
            .as_mut()
            .context("no active bridge session to complete")?;

        if success {
            session.transition(BridgeState::Restored)?;
            self.store.mark_restored(session)?;
            let duration = session.elapsed_secs();
            tracing::info!(
                session = %session.id,
                duration_secs = duration,
                attempts = session.recovery_attempts,
                "bridge recovery complete"
            );
            self.active = None;
            Ok(BridgeState::Restored)
        } else {
            session.transition(BridgeState::Activated)?;
            self.store.update_state(session)?;
            tracing::warn!(
                session = %session.id,
                attempts = session.recovery_attempts,
                "bridge recovery failed, returning to activated"
            );
            Ok(BridgeState::Activated)
        }
    }

    /// Statistics over all recorded sessions.
    pub fn stats(&self) -> Result<BridgeStats> {
        self.store.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn bridge() -> HibernationBridge {
        HibernationBridge::new(
            BridgePolicy::default(),
            BridgeStore::open_in_memory().expect("open store"),
        )
        .expect("bridge")
    }

    fn activate(bridge: &mut HibernationBridge) {
        bridge
            .activate(
                "implement the retry logic",
                MemorySections {
                    technical: "retry with backoff".to_string(),
                    project: "relay engine".to_string(),
                    flow: "user: keep going".to_string(),
                    metadata: "turns:4".to_string(),
                },
                "snapshot-1",
                "deadbeef",
                vec![ProviderId::from("a"), ProviderId::from("b")],
            )
            .expect("activate");
    }

    #[test]
    fn activation_creates_persisted_activated_session() {
        let mut bridge = bridge();
        activate(&mut bridge);

        let session = bridge.active().expect("active");
        assert_eq!(session.state, BridgeState::Activated);
        assert_eq!(session.exhausted_providers.len(), 2);
        assert!(session.user_intent.contains("implementing functionality"));

        let persisted = bridge.store.active_session().expect("query").expect("row");
        assert_eq!(persisted.id, session.id);
        assert_eq!(persisted.snapshot_checksum, "deadbeef");
    }

    #[test]
    fn recovery_prompt_is_self_contained() {
        let mut bridge = bridge();
        activate(&mut bridge);

        let prompt = bridge.begin_recovery().expect("begin");
        assert!(prompt.contains("=== CONTEXT_RECOVERY ==="));
        assert!(prompt.contains("PROJECT_CONTEXT:\nrelay engine"));
        assert!(prompt.contains("TECHNICAL_CONTEXT:\nretry with backoff"));
        assert!(prompt.contains("CURRENT_REQUEST:\n\"implement the retry logic\""));
        assert!(prompt.ends_with("User: implement the retry logic"));
        // Nothing names a concrete provider.
        assert!(!prompt.contains("provider a"));
    }

    #[test]
    fn failed_recovery_returns_to_activated() {
        let mut bridge = bridge();
        activate(&mut bridge);

        bridge.begin_recovery().expect("begin");
        let state = bridge.complete_recovery(false).expect("complete");
        assert_eq!(state, BridgeState::Activated);
        assert_eq!(bridge.active().expect("active").recovery_attempts, 1);

        // A second attempt is legal after the failure loop.
        bridge.begin_recovery().expect("begin again");
        let state = bridge.complete_recovery(true).expect("complete");
        assert_eq!(state, BridgeState::Restored);
        assert!(bridge.active().is_none());
    }

    #[test]
    fn successful_recovery_records_stats() {
        let mut bridge = bridge();
        activate(&mut bridge);
        bridge.begin_recovery().expect("begin");
        bridge.complete_recovery(true).expect("complete");

        let stats = bridge.stats().expect("stats");
        assert_eq!(stats.total_activations, 1);
        assert_eq!(stats.successful_recoveries, 1);
        assert!((stats.success_rate() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn recovery_without_activation_is_rejected() {
        let mut bridge = bridge();
        assert!(bridge.begin_recovery().is_err());
        assert!(bridge.complete_recovery(true).is_err());
    }

    #[test]
    fn double_begin_recovery_is_an_invalid_transition() {
        let mut bridge = bridge();
        activate(&mut bridge);
        bridge.begin_recovery().expect("begin");

        let err = bridge.begin_recovery().expect_err("second begin");
        let relay = err.downcast_ref::<RelayError>().expect("typed error");
        assert!(matches!(relay, RelayError::InvalidBridgeTransition { .. }));
    }

    #[test]
    fn expired_session_times_out() {
        let mut bridge = bridge();
        activate(&mut bridge);
        if let Some(session) = bridge.active.as_mut() {
            session.activated_at = Utc::now() - Duration::hours(2);
        }

        let err = bridge.check_timeout().expect_err("timeout");
        assert!(matches!(err, RelayError::BridgeTimeout { elapsed_secs } if elapsed_secs > 3_600));
    }

    #[test]
    fn recovery_estimate_uses_reset_when_imminent() {
        let policy = BridgePolicy::default();
        let near_midnight = Utc::now()
            .date_naive()
            .and_hms_opt(23, 50, 0)
            .expect("valid time")
            .and_utc();
        let estimate = estimate_recovery_secs(&policy, near_midnight);
        assert_eq!(estimate, 600);

        let midday = Utc::now()
            .date_naive()
            .and_hms_opt(12, 0, 0)
            .expect("valid time")
            .and_utc();
        assert_eq!(
            estimate_recovery_secs(&policy, midday),
            policy.recovery_estimate_secs
        );
    }

    #[test]
    fn bridge_resumes_persisted_session_after_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bridge.db");

        {
            let mut bridge = HibernationBridge::new(
                BridgePolicy::default(),
                BridgeStore::open(&path).expect("open"),
            )
            .expect("bridge");
            activate(&mut bridge);
        }

        let bridge = HibernationBridge::new(
            BridgePolicy::default(),
            BridgeStore::open(&path).expect("reopen"),
        )
        .expect("bridge");
        let session = bridge.active().expect("resumed session");
        assert_eq!(session.state, BridgeState::Activated);
        assert_eq!(session.pending_input, "implement the retry logic");
    }
}
