use chrono::{DateTime, Utc};
use relay_types::{ConversationTurn, Priority};
use sha2::{Digest, Sha256};

use crate::token_estimator::TokenEstimator;

/// What a context element was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    /// Anchors and registered key facts.
    Fact,
    /// A conversation turn.
    Message,
}

impl ElementKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Message => "message",
        }
    }
}

/// One prioritized unit of context.
///
/// The `content_hash` identifies the content across snapshots; equality of
/// hashes is how the validator decides a critical element survived a
/// transfer. Token counts are fixed at construction so optimization never
/// re-tokenizes.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ContextElement {
    pub content: String,
    pub priority: Priority,
    pub kind: ElementKind,
    pub timestamp: DateTime<Utc>,
    pub token_count: u32,
    pub content_hash: String,
}

impl ContextElement {
    /// An element built from an anchor or key fact.
    #[must_use]
    pub fn fact(
        estimator: &dyn TokenEstimator,
        content: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self::build(estimator, content.into(), priority, ElementKind::Fact)
    }

    /// An element built from a conversation turn.
    #[must_use]
    pub fn message(
        estimator: &dyn TokenEstimator,
        turn: &ConversationTurn,
        priority: Priority,
    ) -> Self {
        Self::build(
            estimator,
            turn.content.clone(),
            priority,
            ElementKind::Message,
        )
    }

    fn build(
        estimator: &dyn TokenEstimator,
        content: String,
        priority: Priority,
        kind: ElementKind,
    ) -> Self {
        let token_count = estimator.count(&content);
        let content_hash = content_hash(&content);
        Self {
            content,
            priority,
            kind,
            timestamp: Utc::now(),
            token_count,
            content_hash,
        }
    }
}

/// Sum of element token counts.
#[must_use]
pub fn total_tokens(elements: &[ContextElement]) -> u32 {
    elements.iter().map(|e| e.token_count).sum()
}

/// Short content identifier: the first 16 hex characters of the SHA-256
/// digest. Long enough to make collisions a non-issue at snapshot scale.
#[must_use]
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}
