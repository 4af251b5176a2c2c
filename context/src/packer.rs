//! Priority-weighted context packing and token-budget optimization.
//!
//! Packing turns a conversation transcript plus registered anchors and key
//! facts into prioritized [`ContextElement`]s; optimization prunes the
//! elements to a token budget from the bottom of the priority order upward.

use std::collections::BTreeMap;

use relay_types::{ConversationTurn, Priority};

use crate::element::{ContextElement, content_hash, total_tokens};
use crate::token_estimator::TokenEstimator;

/// Keywords that keep an older turn in the packed context at MEDIUM
/// priority instead of LOW.
const RELEVANCE_KEYWORDS: [&str; 6] = ["code", "function", "error", "implement", "bug", "feature"];

const TRUNCATION_SUFFIX: &str = "...[TRUNCATED]";

/// Packs conversation state into prioritized context elements.
///
/// Anchors are critical identifiers (assistant name, project, deploy
/// target) rendered as a single `ANCHORS:` fact; key facts are statements
/// registered as must-preserve. Both always pack at CRITICAL priority.
#[derive(Debug, Default, Clone)]
pub struct ContextPacker {
    anchors: BTreeMap<String, String>,
    key_facts: Vec<String>,
}

impl ContextPacker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_anchor(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.anchors.insert(key.into(), value.into());
    }

    /// Registers a statement that must survive every compression.
    pub fn add_key_fact(&mut self, fact: impl Into<String>) {
        let fact = fact.into();
        if !self.key_facts.contains(&fact) {
            self.key_facts.push(fact);
        }
    }

    #[must_use]
    pub fn anchor_count(&self) -> usize {
        self.anchors.len()
    }

    /// Packs the transcript into prioritized elements.
    ///
    /// Anchors and key facts (plus `extra_facts`) pack at CRITICAL; the last
    /// `window_size` turns at HIGH; older turns mentioning a relevance
    /// keyword at MEDIUM; every remaining turn at LOW.
    #[must_use]
    pub fn pack(
        &self,
        estimator: &dyn TokenEstimator,
        history: &[ConversationTurn],
        extra_facts: &[String],
        window_size: usize,
    ) -> Vec<ContextElement> {
        let mut elements = Vec::new();

        if !self.anchors.is_empty() {
            let rendered = self
                .anchors
                .iter()
                .map(|(k, v)| format!("{k}:{v}"))
                .collect::<Vec<_>>()
                .join(" | ");
            elements.push(ContextElement::fact(
                estimator,
                format!("ANCHORS: {rendered}"),
                Priority::Critical,
            ));
        }

        for fact in extra_facts.iter().chain(self.key_facts.iter()) {
            elements.push(ContextElement::fact(estimator, fact, Priority::Critical));
        }

        let split = history.len().saturating_sub(window_size);
        let (older, recent) = history.split_at(split);

        for turn in older {
            let lowered = turn.content.to_lowercase();
            let priority = if RELEVANCE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
                Priority::Medium
            } else {
                Priority::Low
            };
            elements.push(ContextElement::message(estimator, turn, priority));
        }

        for turn in recent {
            elements.push(ContextElement::message(estimator, turn, Priority::High));
        }

        elements
    }
}

/// Result of pruning elements to a token budget.
#[derive(Debug, Clone)]
pub struct OptimizeOutcome {
    pub elements: Vec<ContextElement>,
    pub total_tokens: u32,
    /// Elements removed to meet the budget.
    pub dropped: usize,
    /// A CRITICAL element was dropped or truncated. Only reachable with
    /// `preserve_critical = false`; callers surface this, never swallow it.
    pub degraded: bool,
}

/// Prunes `elements` to fit `budget` tokens.
///
/// CRITICAL elements are kept unconditionally when `preserve_critical` is
/// set, then HIGH, MEDIUM, and LOW fill the remaining budget in that order.
/// With `preserve_critical = false` an over-budget result falls back to
/// emergency compression: highest priority first, truncating the first
/// element that does not fit.
#[must_use]
pub fn optimize(
    estimator: &dyn TokenEstimator,
    elements: Vec<ContextElement>,
    budget: u32,
    preserve_critical: bool,
) -> OptimizeOutcome {
    let input_len = elements.len();
    let critical_before: Vec<String> = elements
        .iter()
        .filter(|e| e.priority == Priority::Critical)
        .map(|e| e.content_hash.clone())
        .collect();

    if total_tokens(&elements) <= budget {
        let total = total_tokens(&elements);
        return OptimizeOutcome {
            elements,
            total_tokens: total,
            dropped: 0,
            degraded: false,
        };
    }

    let mut result: Vec<ContextElement> = Vec::new();
    if preserve_critical {
        result.extend(
            elements
                .iter()
                .filter(|e| e.priority == Priority::Critical)
                .cloned(),
        );
    }

    let mut remaining = budget.saturating_sub(total_tokens(&result));
    let tiers = if preserve_critical {
        &Priority::DESCENDING[1..]
    } else {
        &Priority::DESCENDING[..]
    };
    for &tier in tiers {
        for element in elements.iter().filter(|e| e.priority == tier) {
            if element.token_count <= remaining {
                remaining -= element.token_count;
                result.push(element.clone());
            }
        }
    }

    if !preserve_critical && total_tokens(&result) > budget {
        result = emergency_compress(estimator, result, budget);
    }

    let critical_after: Vec<&str> = result
        .iter()
        .filter(|e| e.priority == Priority::Critical)
        .map(|e| e.content_hash.as_str())
        .collect();
    let degraded = critical_before
        .iter()
        .any(|h| !critical_after.contains(&h.as_str()));
    if degraded {
        tracing::warn!(
            budget,
            kept = result.len(),
            "critical context dropped during optimization"
        );
    }

    let total = total_tokens(&result);
    OptimizeOutcome {
        dropped: input_len - result.len(),
        elements: result,
        total_tokens: total,
        degraded,
    }
}

/// Last resort when even the greedy pass is over budget: keep elements in
/// descending priority order and truncate the first one that does not fit.
fn emergency_compress(
    estimator: &dyn TokenEstimator,
    elements: Vec<ContextElement>,
    budget: u32,
) -> Vec<ContextElement> {
    let mut by_priority = elements;
    by_priority.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut compressed = Vec::new();
    let mut remaining = budget;

    for element in by_priority {
        if element.token_count <= remaining {
            remaining -= element.token_count;
            compressed.push(element);
        } else {
            // The suffix costs tokens too; reserve them before cutting.
            let reserve = estimator.count(TRUNCATION_SUFFIX);
            if remaining <= reserve {
                break;
            }
            let truncated = estimator.truncate(&element.content, remaining - reserve);
            let content = format!("{truncated}{TRUNCATION_SUFFIX}");
            compressed.push(ContextElement {
                content_hash: content_hash(&content),
                token_count: estimator.count(&content),
                content,
                ..element
            });
            break;
        }
    }

    compressed
}
