//! Transfer-context rendering.
//!
//! The handoff prompt embeds the packed context as a marked block the
//! receiving model can parse back out:
//!
//! ```text
//! [CONTEXT_INTEGRITY_MARKER]
//! CHECKSUM: 3fa85f64f0e2b1c9
//! CRITICAL_FACTS: 2
//! TOTAL_TOKENS: 118
//!
//! [CRITICAL]
//! ...
//!
//! [HIGH]
//! ...
//!
//! [CONTEXT_END]
//! ```

use relay_types::Priority;

use crate::element::{ContextElement, total_tokens};
use crate::snapshot::{Verdict, compute_checksum};

pub const INTEGRITY_MARKER: &str = "[CONTEXT_INTEGRITY_MARKER]";
pub const END_MARKER: &str = "[CONTEXT_END]";

/// Renders elements as a marked transfer block, grouped by priority tier in
/// descending order.
#[must_use]
pub fn render_transfer_context(elements: &[ContextElement]) -> String {
    let short_checksum: String = compute_checksum(elements).chars().take(16).collect();
    let critical_count = elements
        .iter()
        .filter(|e| e.priority == Priority::Critical)
        .count();

    let mut lines = vec![
        INTEGRITY_MARKER.to_string(),
        format!("CHECKSUM: {short_checksum}"),
        format!("CRITICAL_FACTS: {critical_count}"),
        format!("TOTAL_TOKENS: {}", total_tokens(elements)),
        String::new(),
    ];

    for priority in Priority::DESCENDING {
        let tier: Vec<&ContextElement> =
            elements.iter().filter(|e| e.priority == priority).collect();
        if tier.is_empty() {
            continue;
        }
        lines.push(format!("[{}]", priority.as_str().to_uppercase()));
        for element in tier {
            lines.push(element.content.clone());
        }
        lines.push(String::new());
    }

    lines.push(END_MARKER.to_string());
    lines.join("\n")
}

/// Structural check of a rendered transfer block.
///
/// Verifies both markers are present, a checksum line exists, and the
/// number of lines in the `[CRITICAL]` section matches the declared
/// `CRITICAL_FACTS` count. Elements containing newlines render as multiple
/// lines, so callers pack single-line facts when they intend to re-validate.
#[must_use]
pub fn validate_transfer_context(text: &str) -> Verdict {
    if !text.contains(INTEGRITY_MARKER) {
        return Verdict::Fail {
            reason: "missing integrity marker".to_string(),
        };
    }
    if !text.contains(END_MARKER) {
        return Verdict::Fail {
            reason: "missing end marker".to_string(),
        };
    }

    let mut declared_checksum = None;
    let mut declared_critical = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("CHECKSUM:") {
            declared_checksum = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("CRITICAL_FACTS:") {
            declared_critical = rest.trim().parse::<usize>().ok();
        }
    }

    if declared_checksum.is_none_or(|c| c.is_empty()) {
        return Verdict::Fail {
            reason: "missing checksum".to_string(),
        };
    }

    if let Some(expected) = declared_critical {
        let mut in_critical = false;
        let mut found = 0usize;
        for line in text.lines() {
            if line == "[CRITICAL]" {
                in_critical = true;
            } else if line.starts_with('[') {
                in_critical = false;
            } else if in_critical && !line.trim().is_empty() {
                found += 1;
            }
        }
        if found != expected {
            return Verdict::Fail {
                reason: format!("critical fact count mismatch: declared {expected}, found {found}"),
            };
        }
    }

    Verdict::Pass
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_estimator::HeuristicEstimator;

    fn fact(content: &str, priority: Priority) -> ContextElement {
        ContextElement::fact(&HeuristicEstimator, content, priority)
    }

    fn sample_elements() -> Vec<ContextElement> {
        vec![
            fact("ANCHORS: project:relay", Priority::Critical),
            fact("staging deploys are frozen", Priority::Critical),
            fact("recent discussion point", Priority::High),
            fact("older but relevant", Priority::Medium),
        ]
    }

    #[test]
    fn rendered_block_round_trips_validation() {
        let text = render_transfer_context(&sample_elements());
        assert!(text.starts_with(INTEGRITY_MARKER));
        assert!(text.ends_with(END_MARKER));
        assert!(text.contains("CRITICAL_FACTS: 2"));
        assert_eq!(validate_transfer_context(&text), Verdict::Pass);
    }

    #[test]
    fn tiers_render_in_descending_order() {
        let text = render_transfer_context(&sample_elements());
        let critical = text.find("[CRITICAL]").expect("critical section");
        let high = text.find("[HIGH]").expect("high section");
        let medium = text.find("[MEDIUM]").expect("medium section");
        assert!(critical < high);
        assert!(high < medium);
        assert!(!text.contains("[LOW]"));
    }

    #[test]
    fn missing_markers_fail_validation() {
        assert!(!validate_transfer_context("no markers at all").passed());

        let truncated = render_transfer_context(&sample_elements()).replace(END_MARKER, "");
        assert_eq!(
            validate_transfer_context(&truncated).reason(),
            Some("missing end marker")
        );
    }

    #[test]
    fn tampered_critical_section_fails_validation() {
        let text = render_transfer_context(&sample_elements())
            .replace("staging deploys are frozen\n", "");
        let verdict = validate_transfer_context(&text);
        assert!(
            verdict
                .reason()
                .is_some_and(|r| r.contains("count mismatch"))
        );
    }
}
