//! Predictive provider handoffs.
//!
//! A handoff fires *before* the context window overflows: the manager
//! predicts the next response size from the prompt, and when predicted
//! usage crosses the trigger ratio it compresses the conversation into a
//! budgeted transfer block for a larger-window provider.

use std::sync::Arc;

use relay_context::{
    ContextElement, ContextPacker, ContextSnapshot, MemorySections, TokenEstimator, Verdict,
    optimize, render_transfer_context, total_tokens, validate,
};
use relay_types::{ConversationTurn, HandoffPolicy, Priority, ProviderSpec};

/// Prompts matching one of these read as technical work and predict a
/// longer response.
const COMPLEXITY_KEYWORDS: [&str; 10] = [
    "code",
    "function",
    "class",
    "implement",
    "debug",
    "error",
    "algorithm",
    "optimize",
    "explain",
    "how to",
];

const COMPLEX_MULTIPLIER: f64 = 2.0;
const SIMPLE_MULTIPLIER: f64 = 1.2;
const SAFETY_BUFFER: f64 = 1.2;

/// Turns packed at HIGH priority when building the transfer context.
pub(crate) const PACK_WINDOW: usize = 10;

/// Result of a handoff check.
#[derive(Debug, Clone, PartialEq)]
pub struct HandoffDecision {
    pub trigger: bool,
    /// Current tokens plus the predicted response.
    pub predicted_total: u32,
    /// Predicted usage as a fraction of the provider's window.
    pub usage_ratio: f64,
    pub reason: String,
}

/// A compressed transfer ready to send to the target provider.
#[derive(Debug, Clone)]
pub struct PreparedHandoff {
    /// Transfer block plus the pending input.
    pub prompt: String,
    /// What the transfer was required to preserve.
    pub carried: ContextSnapshot,
    /// What actually fit the compression budget.
    pub delivered: ContextSnapshot,
    pub verdict: Verdict,
    /// Validation still failed after the re-compression retry; the
    /// conversation proceeds with best-effort context.
    pub degraded: bool,
    pub compressed_tokens: u32,
}

/// Decides when to hand off and builds the compressed transfer.
pub struct HandoffManager {
    policy: HandoffPolicy,
    estimator: Arc<dyn TokenEstimator>,
}

impl HandoffManager {
    #[must_use]
    pub fn new(policy: HandoffPolicy, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { policy, estimator }
    }

    /// Predicted response size for `prompt`, in tokens.
    ///
    /// Technical prompts predict at twice the prompt length, conversational
    /// ones slightly above it; both carry a safety buffer and cap at the
    /// configured maximum.
    #[must_use]
    pub fn predict_response_tokens(&self, prompt: &str) -> u32 {
        let prompt_tokens = f64::from(self.estimator.count(prompt));
        let lowered = prompt.to_lowercase();
        let is_complex = COMPLEXITY_KEYWORDS.iter().any(|k| lowered.contains(k));

        let multiplier = if is_complex {
            COMPLEX_MULTIPLIER
        } else {
            SIMPLE_MULTIPLIER
        };
        let predicted = (prompt_tokens * multiplier * SAFETY_BUFFER) as u32;
        predicted.min(self.policy.predicted_response_cap)
    }

    /// Whether the next exchange would push `provider` past the trigger
    /// ratio.
    #[must_use]
    pub fn should_handoff(
        &self,
        provider: &ProviderSpec,
        current_tokens: u32,
        next_input: &str,
    ) -> HandoffDecision {
        let predicted_response = self.predict_response_tokens(next_input);
        let predicted_total = current_tokens.saturating_add(predicted_response);
        let usage_ratio = f64::from(predicted_total) / f64::from(provider.context_window.max(1));

        let trigger = usage_ratio >= self.policy.trigger_ratio;
        let reason = if trigger {
            format!(
                "predicted {:.1}% usage ({predicted_total}/{} tokens)",
                usage_ratio * 100.0,
                provider.context_window
            )
        } else {
            String::new()
        };

        HandoffDecision {
            trigger,
            predicted_total,
            usage_ratio,
            reason,
        }
    }

    /// Builds the compressed transfer for `target`.
    ///
    /// The carried set is every CRITICAL element of the packed context plus
    /// the sectioned conversation memory; validation confirms the budgeted
    /// result preserved it. On a mismatch the compression runs once more
    /// with a larger budget before the result is marked degraded.
    #[must_use]
    pub fn prepare(
        &self,
        packer: &ContextPacker,
        history: &[ConversationTurn],
        project_context: Option<&str>,
        target: &ProviderSpec,
        next_input: &str,
    ) -> PreparedHandoff {
        let budget = self.policy.compression_budget(target.context_window);
        let packed = packer.pack(self.estimator.as_ref(), history, &[], PACK_WINDOW);
        let sections = MemorySections::extract(history, &[], project_context);

        let (carried, delivered, verdict) = self.compress(&packed, &sections, budget);
        let (carried, delivered, verdict, degraded) = if verdict.passed() {
            (carried, delivered, verdict, false)
        } else {
            let retry_budget =
                (f64::from(budget) * self.policy.retry_budget_multiplier) as u32;
            tracing::warn!(
                budget,
                retry_budget,
                reason = verdict.reason().unwrap_or_default(),
                "transfer validation failed, retrying with larger budget"
            );
            let (carried, delivered, verdict) = self.compress(&packed, &sections, retry_budget);
            let degraded = !verdict.passed();
            if degraded {
                tracing::warn!(
                    reason = verdict.reason().unwrap_or_default(),
                    "transfer still degraded after retry, proceeding best-effort"
                );
            }
            (carried, delivered, verdict, degraded)
        };

        let prompt = format!(
            "{}\n\nContinuing conversation. {next_input}",
            render_transfer_context(&delivered.elements)
        );

        PreparedHandoff {
            prompt,
            compressed_tokens: delivered.total_tokens,
            carried,
            delivered,
            verdict,
            degraded,
        }
    }

    fn compress(
        &self,
        packed: &[ContextElement],
        sections: &MemorySections,
        budget: u32,
    ) -> (ContextSnapshot, ContextSnapshot, Verdict) {
        let mut carried: Vec<ContextElement> = packed
            .iter()
            .filter(|e| e.priority == Priority::Critical)
            .cloned()
            .collect();

        let section_budget = budget.saturating_sub(total_tokens(&carried));
        if !sections.is_empty() && section_budget > 0 {
            let compressed =
                sections.compress(self.estimator.as_ref(), section_budget, &self.policy.split);
            carried.push(ContextElement::fact(
                self.estimator.as_ref(),
                compressed,
                Priority::High,
            ));
        }

        let before = ContextSnapshot::capture(carried.clone());
        let fitted = optimize(self.estimator.as_ref(), carried, budget, true);
        let after = ContextSnapshot::capture(fitted.elements);
        let verdict = validate(&before, &after, self.policy.validation_tolerance);

        (before, after, verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_context::HeuristicEstimator;
    use relay_types::Role;

    fn manager() -> HandoffManager {
        HandoffManager::new(HandoffPolicy::default(), Arc::new(HeuristicEstimator))
    }

    #[test]
    fn complex_prompts_predict_longer_responses() {
        let manager = manager();
        let padding = "x ".repeat(100);
        let simple = manager.predict_response_tokens(&format!("tell me a story {padding}"));
        let complex =
            manager.predict_response_tokens(&format!("implement a function for {padding}"));
        assert!(complex > simple);
    }

    #[test]
    fn prediction_is_capped() {
        let manager = manager();
        let huge = "implement ".repeat(2_000);
        assert_eq!(
            manager.predict_response_tokens(&huge),
            HandoffPolicy::default().predicted_response_cap
        );
    }

    #[test]
    fn handoff_triggers_at_eighty_percent_predicted() {
        let manager = manager();
        let provider = ProviderSpec::new("small", 1_000);

        let calm = manager.should_handoff(&provider, 100, "hi");
        assert!(!calm.trigger);
        assert!(calm.reason.is_empty());

        let pressed = manager.should_handoff(&provider, 790, "explain this error in my code");
        assert!(pressed.trigger);
        assert!(pressed.usage_ratio >= 0.80);
        assert!(pressed.reason.contains("% usage"));
    }

    #[test]
    fn boundary_prediction_pushes_past_the_threshold() {
        let manager = manager();
        let provider = ProviderSpec::new("boundary", 4_096);
        // 260 chars of plain text estimate to 65 tokens; the simple
        // multiplier and safety buffer predict a 93-token response.
        let prompt = "a".repeat(260);
        assert_eq!(manager.predict_response_tokens(&prompt), 93);

        let decision = manager.should_handoff(&provider, 3_300, &prompt);
        assert!(decision.trigger);
        assert_eq!(decision.predicted_total, 3_393);
        assert!((decision.usage_ratio - 3_393.0 / 4_096.0).abs() < 1e-9);
    }

    #[test]
    fn near_threshold_does_not_trigger_below_ratio() {
        let manager = manager();
        let provider = ProviderSpec::new("mid", 10_000);
        // Prediction for a trivial prompt is tiny; 70% current stays under.
        let decision = manager.should_handoff(&provider, 7_000, "ok");
        assert!(!decision.trigger);
    }

    #[test]
    fn prepare_builds_marked_prompt_within_budget() {
        let manager = manager();
        let mut packer = ContextPacker::new();
        packer.set_anchor("project", "relay");
        packer.add_key_fact("deploy target is eu-west-1");

        let history: Vec<ConversationTurn> = (0..20)
            .map(|i| ConversationTurn::new(Role::User, format!("implement feature number {i}")))
            .collect();
        let target = ProviderSpec::new("wide", 131_072);

        let prepared = manager.prepare(&packer, &history, Some("relay engine"), &target, "go on");

        assert!(prepared.prompt.contains("[CONTEXT_INTEGRITY_MARKER]"));
        assert!(prepared.prompt.ends_with("Continuing conversation. go on"));
        assert!(prepared.verdict.passed());
        assert!(!prepared.degraded);
        // Budget for a 131k window caps at 300.
        assert!(prepared.compressed_tokens <= 300);
        assert_eq!(prepared.carried.checksum, prepared.delivered.checksum);
    }

    #[test]
    fn prepare_preserves_critical_facts_in_prompt() {
        let manager = manager();
        let mut packer = ContextPacker::new();
        packer.add_key_fact("the api contract is frozen");

        let history = vec![ConversationTurn::new(Role::User, "continue the work")];
        let target = ProviderSpec::new("target", 32_768);

        let prepared = manager.prepare(&packer, &history, None, &target, "next step");
        assert!(prepared.prompt.contains("the api contract is frozen"));
    }
}
