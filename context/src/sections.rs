//! Sectioned conversation memory for handoff compression.
//!
//! A handoff carries four sections in descending importance: technical
//! detail, project state, conversational flow, and metadata. Each section
//! gets a fixed share of the compression budget so a verbose transcript
//! cannot starve the technical context out of the transfer prompt.

use relay_types::{CompressionSplit, ConversationTurn};

use crate::token_estimator::TokenEstimator;

const TECHNICAL_KEYWORDS: [&str; 6] = ["code", "function", "class", "error", "bug", "implement"];
const PROJECT_KEYWORDS: [&str; 5] = ["project", "goal", "implement", "feature", "task"];

/// Turns scanned for technical content.
const TECHNICAL_SCAN: usize = 10;
/// Turns scanned for project-state content.
const PROJECT_SCAN: usize = 5;
/// Turns quoted verbatim as conversational flow.
const FLOW_TURNS: usize = 3;

const TECHNICAL_EXCERPT_CHARS: usize = 200;
const PROJECT_EXCERPT_CHARS: usize = 150;
const FLOW_EXCERPT_CHARS: usize = 100;

/// Extracted conversation memory, one string per section.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MemorySections {
    pub technical: String,
    pub project: String,
    pub flow: String,
    pub metadata: String,
}

impl MemorySections {
    /// Extracts sections from the tail of the transcript.
    ///
    /// `technical_files` are carried verbatim ahead of scanned excerpts;
    /// `project_context` seeds the project section before keyword-matched
    /// turns are appended.
    #[must_use]
    pub fn extract(
        history: &[ConversationTurn],
        technical_files: &[String],
        project_context: Option<&str>,
    ) -> Self {
        let mut technical_parts: Vec<String> = technical_files.iter().take(3).cloned().collect();
        for turn in tail(history, TECHNICAL_SCAN) {
            let lowered = turn.content.to_lowercase();
            if TECHNICAL_KEYWORDS.iter().any(|k| lowered.contains(k)) {
                technical_parts.push(excerpt(&turn.content, TECHNICAL_EXCERPT_CHARS));
            }
        }

        let mut project = project_context.unwrap_or_default().to_string();
        for turn in tail(history, PROJECT_SCAN) {
            let lowered = turn.content.to_lowercase();
            if PROJECT_KEYWORDS.iter().any(|k| lowered.contains(k)) {
                project.push(' ');
                project.push_str(&excerpt(&turn.content, PROJECT_EXCERPT_CHARS));
            }
        }

        let flow = tail(history, FLOW_TURNS)
            .iter()
            .map(|turn| {
                format!(
                    "{}: {}",
                    turn.role.as_str(),
                    excerpt(&turn.content, FLOW_EXCERPT_CHARS)
                )
            })
            .collect::<Vec<_>>()
            .join(" | ");

        Self {
            technical: technical_parts.join(" | "),
            project: project.trim().to_string(),
            flow,
            metadata: format!("turns:{}", history.len()),
        }
    }

    /// Compresses the sections into one string within `budget` tokens.
    ///
    /// Each non-empty section is truncated to its share of the budget and
    /// tagged with a short prefix so the receiving model can tell the
    /// sections apart.
    #[must_use]
    pub fn compress(
        &self,
        estimator: &dyn TokenEstimator,
        budget: u32,
        split: &CompressionSplit,
    ) -> String {
        let allocations = [
            ("TECH:", &self.technical, split.technical),
            ("STATE:", &self.project, split.project),
            ("FLOW:", &self.flow, split.flow),
            ("META:", &self.metadata, split.metadata),
        ];

        let mut parts = Vec::new();
        for (prefix, text, fraction) in allocations {
            if text.is_empty() {
                continue;
            }
            let section_budget = (f64::from(budget) * fraction) as u32;
            let tagged = format!("{prefix} {text}");
            let truncated = estimator.truncate(&tagged, section_budget);
            // A share can round down to nothing; an empty part would leave
            // a stray separator in the joined block.
            if !truncated.is_empty() {
                parts.push(truncated);
            }
        }

        let compressed = parts.join(" | ");

        // Section budgets round independently; re-truncate if the joined
        // string still overshoots.
        if estimator.count(&compressed) > budget {
            estimator.truncate(&compressed, budget)
        } else {
            compressed
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.technical.is_empty() && self.project.is_empty() && self.flow.is_empty()
    }
}

fn tail(history: &[ConversationTurn], n: usize) -> &[ConversationTurn] {
    &history[history.len().saturating_sub(n)..]
}

fn excerpt(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_estimator::HeuristicEstimator;
    use relay_types::Role;

    fn turn(role: Role, content: &str) -> ConversationTurn {
        ConversationTurn::new(role, content)
    }

    fn sample_history() -> Vec<ConversationTurn> {
        vec![
            turn(Role::User, "let's implement the retry feature"),
            turn(Role::Assistant, "the function needs an error branch"),
            turn(Role::User, "sounds good, thanks"),
        ]
    }

    #[test]
    fn extract_routes_content_into_sections() {
        let history = sample_history();
        let sections = MemorySections::extract(&history, &[], Some("building the relay engine"));

        assert!(sections.technical.contains("error branch"));
        assert!(sections.project.starts_with("building the relay engine"));
        assert!(sections.project.contains("retry feature"));
        assert!(sections.flow.contains("assistant: the function"));
        assert_eq!(sections.metadata, "turns:3");
    }

    #[test]
    fn extract_carries_technical_files_first() {
        let sections = MemorySections::extract(&[], &["src/engine.rs".to_string()], None);
        assert_eq!(sections.technical, "src/engine.rs");
        assert_eq!(sections.metadata, "turns:0");
    }

    #[test]
    fn extract_of_empty_history_is_mostly_empty() {
        let sections = MemorySections::extract(&[], &[], None);
        assert!(sections.is_empty());
    }

    #[test]
    fn compress_fits_the_budget() {
        let history: Vec<ConversationTurn> = (0..20)
            .map(|i| {
                turn(
                    Role::User,
                    &format!("implement feature {i} because of an error in the code"),
                )
            })
            .collect();
        let sections = MemorySections::extract(&history, &[], Some("big project context"));

        let estimator = HeuristicEstimator;
        let compressed = sections.compress(&estimator, 60, &CompressionSplit::default());
        assert!(estimator.count(&compressed) <= 60);
        assert!(compressed.contains("TECH:"));
    }

    #[test]
    fn compress_with_tiny_budget_has_no_stray_separators() {
        let sections = MemorySections {
            technical: "t".repeat(400),
            project: "p".repeat(400),
            flow: "f".to_string(),
            metadata: "turns:9".to_string(),
        };

        // Shares of a 4-token budget: flow and metadata round to zero.
        let compressed = sections.compress(&HeuristicEstimator, 4, &CompressionSplit::default());
        assert!(!compressed.is_empty());
        assert!(!compressed.starts_with(" | "));
        assert!(!compressed.ends_with(" | "));
        assert!(!compressed.contains("|  |"));
    }

    #[test]
    fn compress_skips_empty_sections() {
        let sections = MemorySections {
            technical: String::new(),
            project: "state only".to_string(),
            flow: String::new(),
            metadata: String::new(),
        };
        let compressed = sections.compress(&HeuristicEstimator, 100, &CompressionSplit::default());
        assert!(compressed.starts_with("STATE:"));
        assert!(!compressed.contains("TECH:"));
        assert!(!compressed.contains('|'));
    }
}
