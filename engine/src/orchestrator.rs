//! The orchestration facade.
//!
//! One request enters; the orchestrator selects a provider, walks the
//! fallback sequence on failure, hands off to a larger window when the
//! context is about to overflow, and hibernates through the bridge when
//! every provider is exhausted. Every attempt is recorded as an outcome
//! so the next selection sees it.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use relay_context::{
    ContextPacker, ContextSnapshot, IntegrityStats, IntegrityStore, MemorySections,
    TokenEstimator, Verdict, validate,
};
use relay_monitor::{
    OutcomeStore, PerformanceMonitor, ProviderSelector, RankedProvider, Selection,
};
use relay_providers::CompletionClient;
use relay_types::{
    ConversationTurn, FailureKind, HandoffRecord, ProviderId, ProviderRegistry, RelayError,
    RelayPolicy, RequestOutcome, SessionId,
};

use crate::bridge::{
    BridgePoll, BridgeResolution, BridgeSession, BridgeStats, BridgeStore, HibernationBridge,
};
use crate::handoff::{HandoffDecision, HandoffManager, PACK_WINDOW, PreparedHandoff};

/// Terminal result of a completion attempt.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    Completed {
        provider: ProviderId,
        content: String,
        latency_ms: u64,
    },
    /// Every provider was exhausted; the bridge holds the request.
    Hibernated(SessionId),
}

/// Result of an executed handoff.
#[derive(Debug, Clone)]
pub struct HandoffOutcome {
    pub target: ProviderId,
    pub prepared: PreparedHandoff,
    pub record: HandoffRecord,
}

/// Result of one bridge recovery attempt.
#[derive(Debug, Clone)]
pub enum RecoveryOutcome {
    Restored {
        provider: ProviderId,
        content: String,
        /// Pre-hibernation snapshot validated against the restored context.
        verdict: Verdict,
    },
    /// The attempt failed; the bridge stays activated.
    Failed {
        provider: ProviderId,
        kind: FailureKind,
    },
    /// No provider was available to attempt recovery against.
    StillExhausted,
}

/// Aggregate view over every subsystem, for status reporting.
#[derive(Debug, Clone)]
pub struct RelayStats {
    pub rankings: Vec<RankedProvider>,
    pub handoffs: Vec<HandoffRecord>,
    pub bridge: BridgeStats,
    pub integrity: IntegrityStats,
}

/// Coordinates selection, handoffs, hibernation, and integrity tracking.
pub struct Orchestrator<S, C> {
    selector: ProviderSelector<S>,
    handoff: HandoffManager,
    packer: ContextPacker,
    bridge: HibernationBridge,
    integrity: IntegrityStore,
    client: C,
    estimator: Arc<dyn TokenEstimator>,
    validation_tolerance: f64,
    handoff_history: Vec<HandoffRecord>,
}

impl<S: OutcomeStore, C: CompletionClient> Orchestrator<S, C> {
    pub fn new(
        registry: ProviderRegistry,
        policy: RelayPolicy,
        outcomes: S,
        client: C,
        integrity: IntegrityStore,
        bridge_store: BridgeStore,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Result<Self> {
        let RelayPolicy {
            weights,
            selection,
            handoff,
            bridge,
        } = policy;
        let validation_tolerance = handoff.validation_tolerance;

        Ok(Self {
            selector: ProviderSelector::new(
                registry,
                PerformanceMonitor::new(outcomes, weights, selection),
            ),
            handoff: HandoffManager::new(handoff, Arc::clone(&estimator)),
            packer: ContextPacker::new(),
            bridge: HibernationBridge::new(bridge, bridge_store)?,
            integrity,
            client,
            estimator,
            validation_tolerance,
            handoff_history: Vec::new(),
        })
    }

    /// Durable facts injected at CRITICAL priority into every transfer.
    pub fn packer_mut(&mut self) -> &mut ContextPacker {
        &mut self.packer
    }

    #[must_use]
    pub fn bridge_session(&self) -> Option<&BridgeSession> {
        self.bridge.active()
    }

    #[must_use]
    pub fn handoff_history(&self) -> &[HandoffRecord] {
        &self.handoff_history
    }

    /// Best provider for the next request, or `NoneAvailable`.
    pub fn select_provider(
        &mut self,
        exclude: &[ProviderId],
        need_large_context: bool,
    ) -> Result<Selection> {
        self.selector.select(exclude, need_large_context)
    }

    /// Records an observed outcome; the next selection reflects it.
    pub fn record_outcome(&mut self, outcome: &RequestOutcome) -> Result<()> {
        self.selector.monitor_mut().record(outcome)
    }

    /// Whether the next exchange would overflow `provider`'s window.
    pub fn should_handoff(
        &self,
        provider: &ProviderId,
        current_tokens: u32,
        next_input: &str,
    ) -> Result<HandoffDecision> {
        let spec = self
            .selector
            .registry()
            .get(provider)
            .ok_or_else(|| RelayError::ProviderUnavailable(provider.clone()))?;
        Ok(self.handoff.should_handoff(spec, current_tokens, next_input))
    }

    /// Compresses the conversation and switches to a larger-window provider.
    ///
    /// Both the carried and delivered snapshots persist to the integrity
    /// store along with the validation verdict, so handoff quality is
    /// auditable after the fact.
    pub fn execute_handoff(
        &mut self,
        from: &ProviderId,
        history: &[ConversationTurn],
        project_context: Option<&str>,
        current_tokens: u32,
        next_input: &str,
    ) -> Result<HandoffOutcome> {
        let decision = self.should_handoff(from, current_tokens, next_input)?;

        let exclude = [from.clone()];
        let target = match self.selector.select(&exclude, true)? {
            Selection::Provider(id) => id,
            Selection::NoneAvailable => return Err(RelayError::AllProvidersExhausted.into()),
        };
        let target_spec = self
            .selector
            .registry()
            .get(&target)
            .cloned()
            .ok_or_else(|| RelayError::ProviderUnavailable(target.clone()))?;

        let prepared = self.handoff.prepare(
            &self.packer,
            history,
            project_context,
            &target_spec,
            next_input,
        );

        self.integrity.record_snapshot(&prepared.carried)?;
        self.integrity.record_snapshot(&prepared.delivered)?;
        self.integrity
            .record_check(&prepared.delivered.id, &prepared.verdict)?;

        let record = HandoffRecord {
            from_provider: from.clone(),
            to_provider: target.clone(),
            pre_tokens: current_tokens,
            predicted_tokens: decision.predicted_total,
            compressed_tokens: prepared.compressed_tokens,
            reason: decision.reason,
            snapshot_checksum: prepared.delivered.checksum.clone(),
            timestamp: Utc::now(),
        };
        tracing::info!(
            from = %record.from_provider,
            to = %record.to_provider,
            reduction_pct = record.reduction_ratio() * 100.0,
            degraded = prepared.degraded,
            "handoff executed"
        );
        self.handoff_history.push(record.clone());

        Ok(HandoffOutcome {
            target,
            prepared,
            record,
        })
    }

    /// Walks the fallback sequence until a completion succeeds.
    ///
    /// Before the walk, the handoff manager checks whether this exchange
    /// would overflow the best-ranked provider's window. When it would,
    /// the conversation is compressed and the walk starts at the
    /// larger-window target with the transfer prompt. Activates the
    /// hibernation bridge instead of failing when the sequence is empty
    /// or every attempt fails.
    pub async fn complete_with_fallback(
        &mut self,
        prompt: &str,
        history: &[ConversationTurn],
        project_context: Option<&str>,
    ) -> Result<CompletionOutcome> {
        let mut sequence = self.selector.fallback_sequence(&[])?;
        let mut attempt_prompt = prompt.to_string();

        if let Some(first) = sequence.first().cloned() {
            let current_tokens = self.conversation_tokens(history);
            let decision = self.should_handoff(&first, current_tokens, prompt)?;
            if decision.trigger {
                match self.execute_handoff(&first, history, project_context, current_tokens, prompt)
                {
                    Ok(HandoffOutcome {
                        target, prepared, ..
                    }) => {
                        attempt_prompt = prepared.prompt;
                        sequence = self.selector.fallback_sequence(&[first])?;
                        sequence.retain(|id| *id != target);
                        sequence.insert(0, target);
                    }
                    Err(err) => match err.downcast_ref::<RelayError>() {
                        // No wider window exists; walk on with the
                        // uncompressed prompt.
                        Some(RelayError::AllProvidersExhausted) => {
                            tracing::warn!(
                                provider = %first,
                                predicted_total = decision.predicted_total,
                                "window pressure without a handoff target"
                            );
                        }
                        _ => return Err(err),
                    },
                }
            }
        }

        for id in sequence {
            let Some(spec) = self.selector.registry().get(&id).cloned() else {
                continue;
            };

            let started = Instant::now();
            match self.client.issue(&spec, &attempt_prompt).await {
                Ok(response) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    self.record_outcome(&RequestOutcome::success(
                        id.clone(),
                        latency_ms,
                        response.tokens_used,
                    ))?;
                    return Ok(CompletionOutcome::Completed {
                        provider: id,
                        content: response.content,
                        latency_ms,
                    });
                }
                Err(err) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    tracing::warn!(provider = %id, error = %err, "completion attempt failed");
                    self.record_outcome(&RequestOutcome::failure(
                        id.clone(),
                        latency_ms,
                        err.kind(),
                    ))?;
                }
            }
        }

        let session = self.activate_bridge(prompt, history, project_context)?;
        Ok(CompletionOutcome::Hibernated(session))
    }

    /// Estimated tokens the conversation already occupies.
    fn conversation_tokens(&self, history: &[ConversationTurn]) -> u32 {
        history
            .iter()
            .map(|turn| self.estimator.count(&turn.content))
            .fold(0, u32::saturating_add)
    }

    /// Preserves the conversation and hibernates until a provider recovers.
    pub fn activate_bridge(
        &mut self,
        pending_input: &str,
        history: &[ConversationTurn],
        project_context: Option<&str>,
    ) -> Result<SessionId> {
        // Re-activating while hibernated would orphan the first session.
        if let Some(session) = self.bridge.active() {
            return Ok(session.id.clone());
        }

        let packed = self
            .packer
            .pack(self.estimator.as_ref(), history, &[], PACK_WINDOW);
        let snapshot = ContextSnapshot::capture(packed);
        self.integrity.record_snapshot(&snapshot)?;

        let sections = MemorySections::extract(history, &[], project_context);
        let exhausted = self.selector.registry().ids();
        let session = self.bridge.activate(
            pending_input,
            sections,
            &snapshot.id,
            &snapshot.checksum,
            exhausted,
        )?;
        Ok(session.id.clone())
    }

    /// One availability check for the active bridge session.
    pub fn poll_bridge(&mut self) -> Result<BridgePoll> {
        self.bridge.poll(&mut self.selector)
    }

    /// Blocks on the bridge polling loop until a provider recovers,
    /// shutdown is signalled, or the bridge times out.
    pub async fn wait_for_recovery(
        &mut self,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<BridgeResolution> {
        self.bridge
            .wait_for_provider(&mut self.selector, shutdown)
            .await
    }

    /// Attempts recovery through the best available provider.
    ///
    /// On success the restored context is re-packed and validated against
    /// the pre-hibernation snapshot; the verdict lands in the integrity
    /// log either way. On failure the bridge returns to `Activated` for a
    /// later attempt.
    pub async fn attempt_recovery(
        &mut self,
        history: &[ConversationTurn],
    ) -> Result<RecoveryOutcome> {
        self.bridge.check_timeout()?;
        let snapshot_id = self
            .bridge
            .active()
            .context("no active bridge session to recover")?
            .snapshot_id
            .clone();

        let provider = match self.selector.select(&[], false)? {
            Selection::Provider(id) => id,
            Selection::NoneAvailable => return Ok(RecoveryOutcome::StillExhausted),
        };
        let spec = self
            .selector
            .registry()
            .get(&provider)
            .cloned()
            .ok_or_else(|| RelayError::ProviderUnavailable(provider.clone()))?;

        let prompt = self.bridge.begin_recovery()?;
        let started = Instant::now();
        match self.client.issue(&spec, &prompt).await {
            Ok(response) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                self.record_outcome(&RequestOutcome::success(
                    provider.clone(),
                    latency_ms,
                    response.tokens_used,
                ))?;
                self.bridge.complete_recovery(true)?;

                let before = self
                    .integrity
                    .load_snapshot(&snapshot_id)?
                    .context("pre-hibernation snapshot missing from integrity store")?;
                let restored = ContextSnapshot::capture(self.packer.pack(
                    self.estimator.as_ref(),
                    history,
                    &[],
                    PACK_WINDOW,
                ));
                let verdict = validate(&before, &restored, self.validation_tolerance);
                self.integrity.record_check(&snapshot_id, &verdict)?;

                Ok(RecoveryOutcome::Restored {
                    provider,
                    content: response.content,
                    verdict,
                })
            }
            Err(err) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                let kind = err.kind();
                self.record_outcome(&RequestOutcome::failure(provider.clone(), latency_ms, kind))?;
                self.bridge.complete_recovery(false)?;
                Ok(RecoveryOutcome::Failed { provider, kind })
            }
        }
    }

    /// Snapshot of every subsystem's statistics.
    pub fn get_stats(&mut self) -> Result<RelayStats> {
        Ok(RelayStats {
            rankings: self.selector.rankings()?,
            handoffs: self.handoff_history.clone(),
            bridge: self.bridge.stats()?,
            integrity: self.integrity.stats()?,
        })
    }
}
