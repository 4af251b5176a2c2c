use relay_types::FailureKind;
use thiserror::Error;

/// A failed completion attempt, classified for the performance monitor.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP 429 or an explicit quota-exceeded body.
    #[error("rate limited by backend")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The backend returned a well-formed response with no content.
    #[error("empty response from backend")]
    EmptyResponse,

    /// The response body could not be decoded.
    #[error("failed to parse response: {detail}")]
    Parse { detail: String },

    /// The request exceeded its configured timeout and was abandoned.
    #[error("request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// Any other HTTP error status.
    #[error("backend returned HTTP {status}")]
    Http { status: u16 },

    /// Transport-level failure (connect, TLS, mid-body).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ProviderError {
    /// The [`FailureKind`] recorded in the outcome log for this error.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::RateLimited { .. } => FailureKind::RateLimited,
            Self::EmptyResponse => FailureKind::EmptyResponse,
            Self::Parse { .. } => FailureKind::ParseError,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Http { .. } | Self::Transport(_) => FailureKind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_variant_maps_to_its_failure_kind() {
        assert_eq!(
            ProviderError::RateLimited {
                retry_after_secs: None
            }
            .kind(),
            FailureKind::RateLimited
        );
        assert_eq!(ProviderError::EmptyResponse.kind(), FailureKind::EmptyResponse);
        assert_eq!(
            ProviderError::Parse {
                detail: "bad json".to_string()
            }
            .kind(),
            FailureKind::ParseError
        );
        assert_eq!(
            ProviderError::Timeout { timeout_secs: 30 }.kind(),
            FailureKind::Timeout
        );
        assert_eq!(ProviderError::Http { status: 500 }.kind(), FailureKind::Unknown);
    }
}
