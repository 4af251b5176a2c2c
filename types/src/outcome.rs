use chrono::{DateTime, Utc};

use crate::ids::ProviderId;

/// Classification of a failed completion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RateLimited,
    EmptyResponse,
    ParseError,
    Timeout,
    Unknown,
}

impl FailureKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::EmptyResponse => "empty_response",
            Self::ParseError => "parse_error",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rate_limited" => Some(Self::RateLimited),
            "empty_response" => Some(Self::EmptyResponse),
            "parse_error" => Some(Self::ParseError),
            "timeout" => Some(Self::Timeout),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// One observed attempt against a provider.
///
/// Outcomes are append-only: created after every attempt, never mutated,
/// periodically summarized by the performance monitor's windowed queries.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RequestOutcome {
    pub provider_id: ProviderId,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: u64,
    pub tokens_used: u32,
    pub error_kind: Option<FailureKind>,
}

impl RequestOutcome {
    /// A successful attempt observed now.
    #[must_use]
    pub fn success(provider_id: ProviderId, latency_ms: u64, tokens_used: u32) -> Self {
        Self {
            provider_id,
            timestamp: Utc::now(),
            success: true,
            latency_ms,
            tokens_used,
            error_kind: None,
        }
    }

    /// A failed attempt observed now.
    #[must_use]
    pub fn failure(provider_id: ProviderId, latency_ms: u64, kind: FailureKind) -> Self {
        Self {
            provider_id,
            timestamp: Utc::now(),
            success: false,
            latency_ms,
            tokens_used: 0,
            error_kind: Some(kind),
        }
    }
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One turn of the conversation transcript.
///
/// Transcripts are owned by an external collaborator; the orchestrator only
/// ever reads them.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}
