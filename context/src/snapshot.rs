//! Immutable context snapshots and transfer validation.
//!
//! A snapshot freezes the packed context before and after a handoff; the
//! validator compares the two to decide whether the transfer preserved what
//! matters. The checksum is order-sensitive: it digests the `(priority,
//! content_hash)` pair of every element in sequence, so a reordering shows
//! up as a different checksum even when the element set is identical.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use relay_types::Priority;
use sha2::{Digest, Sha256};

use crate::element::{ContextElement, total_tokens};

static SNAPSHOT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Frozen context state with an order-sensitive checksum.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ContextSnapshot {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub elements: Vec<ContextElement>,
    pub total_tokens: u32,
    pub checksum: String,
}

impl ContextSnapshot {
    #[must_use]
    pub fn capture(elements: Vec<ContextElement>) -> Self {
        let now = Utc::now();
        let seq = SNAPSHOT_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("snapshot-{}-{seq}", now.timestamp_millis()),
            timestamp: now,
            total_tokens: total_tokens(&elements),
            checksum: compute_checksum(&elements),
            elements,
        }
    }

    fn critical_hashes(&self) -> Vec<&str> {
        self.elements
            .iter()
            .filter(|e| e.priority == Priority::Critical)
            .map(|e| e.content_hash.as_str())
            .collect()
    }
}

/// SHA-256 over the ordered `(priority, content_hash)` pairs, hex-encoded.
#[must_use]
pub fn compute_checksum(elements: &[ContextElement]) -> String {
    let mut hasher = Sha256::new();
    for element in elements {
        hasher.update(element.priority.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(element.content_hash.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Result of validating a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail { reason: String },
}

impl Verdict {
    #[must_use]
    pub const fn passed(&self) -> bool {
        matches!(self, Self::Pass)
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Pass => None,
            Self::Fail { reason } => Some(reason),
        }
    }
}

/// Validates that `after` preserved the integrity of `before`.
///
/// Passes iff every CRITICAL content hash of `before` appears in `after`
/// and the relative token delta is within `tolerance`. Failures carry every
/// detected issue in one reason string.
#[must_use]
pub fn validate(before: &ContextSnapshot, after: &ContextSnapshot, tolerance: f64) -> Verdict {
    let mut issues = Vec::new();

    let critical_before = before.critical_hashes();
    let critical_after = after.critical_hashes();
    let missing = critical_before
        .iter()
        .filter(|h| !critical_after.contains(h))
        .count();
    if missing > 0 {
        issues.push(format!(
            "missing {missing} of {} critical elements",
            critical_before.len()
        ));
    }

    if before.total_tokens > 0 {
        let delta = f64::from(before.total_tokens.abs_diff(after.total_tokens));
        let ratio = delta / f64::from(before.total_tokens);
        if ratio > tolerance {
            issues.push(format!(
                "token delta {:.1}% exceeds tolerance {:.1}%",
                ratio * 100.0,
                tolerance * 100.0
            ));
        }
    }

    let had_anchors = before
        .elements
        .iter()
        .any(|e| e.priority == Priority::Critical && e.content.starts_with("ANCHORS:"));
    if had_anchors {
        let anchors_survived = after
            .elements
            .iter()
            .any(|e| e.priority == Priority::Critical && e.content.starts_with("ANCHORS:"));
        if !anchors_survived {
            issues.push("critical anchors missing after transfer".to_string());
        }
    }

    if issues.is_empty() {
        Verdict::Pass
    } else {
        let reason = issues.join("; ");
        tracing::warn!(
            before_checksum = %before.checksum,
            after_checksum = %after.checksum,
            %reason,
            "context integrity validation failed"
        );
        Verdict::Fail { reason }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_estimator::HeuristicEstimator;

    fn fact(content: &str, priority: Priority) -> ContextElement {
        ContextElement::fact(&HeuristicEstimator, content, priority)
    }

    #[test]
    fn checksum_is_order_sensitive() {
        let a = fact("first", Priority::Critical);
        let b = fact("second", Priority::High);
        let forward = compute_checksum(&[a.clone(), b.clone()]);
        let reversed = compute_checksum(&[b, a]);
        assert_ne!(forward, reversed);
        assert_eq!(forward.len(), 64);
    }

    #[test]
    fn checksum_depends_on_priority() {
        let critical = fact("same content", Priority::Critical);
        let low = fact("same content", Priority::Low);
        assert_ne!(compute_checksum(&[critical]), compute_checksum(&[low]));
    }

    #[test]
    fn identical_elements_validate() {
        let elements = vec![fact("keep me", Priority::Critical), fact("recent", Priority::High)];
        let before = ContextSnapshot::capture(elements.clone());
        let after = ContextSnapshot::capture(elements);
        assert_eq!(validate(&before, &after, 0.1), Verdict::Pass);
    }

    #[test]
    fn snapshot_ids_are_unique() {
        let a = ContextSnapshot::capture(vec![]);
        let b = ContextSnapshot::capture(vec![]);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn missing_critical_element_fails_with_count() {
        let before = ContextSnapshot::capture(vec![
            fact("fact one", Priority::Critical),
            fact("fact two", Priority::Critical),
        ]);
        let after = ContextSnapshot::capture(vec![fact("fact one", Priority::Critical)]);

        let verdict = validate(&before, &after, 1.0);
        assert!(!verdict.passed());
        assert!(
            verdict
                .reason()
                .is_some_and(|r| r.contains("missing 1 of 2 critical elements"))
        );
    }

    #[test]
    fn dropping_a_noncritical_element_within_tolerance_passes() {
        let keep = fact("the critical fact", Priority::Critical);
        let extra = fact("mild", Priority::Low);
        let before = ContextSnapshot::capture(vec![keep.clone(), extra]);
        let after = ContextSnapshot::capture(vec![keep]);

        assert!(validate(&before, &after, 0.5).passed());
    }

    #[test]
    fn large_token_delta_fails() {
        let before = ContextSnapshot::capture(vec![fact(&"a".repeat(400), Priority::High)]);
        let after = ContextSnapshot::capture(vec![fact("a", Priority::High)]);

        let verdict = validate(&before, &after, 0.1);
        assert!(
            verdict
                .reason()
                .is_some_and(|r| r.contains("exceeds tolerance"))
        );
    }

    #[test]
    fn lost_anchors_are_reported() {
        let before = ContextSnapshot::capture(vec![
            fact("ANCHORS: project:relay", Priority::Critical),
            fact("other", Priority::Critical),
        ]);
        let after = ContextSnapshot::capture(vec![fact("other", Priority::Critical)]);

        let verdict = validate(&before, &after, 1.0);
        assert!(
            verdict
                .reason()
                .is_some_and(|r| r.contains("anchors missing"))
        );
    }
}
