use thiserror::Error;

use crate::ids::ProviderId;
use crate::outcome::FailureKind;

/// Orchestrator error taxonomy.
///
/// Everything below `AllProvidersExhausted` is recovered internally (fallback
/// walk, re-compression retry) and is never shown to the end user; only the
/// two fatal variants and degraded-integrity warnings escape the engine.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The provider is excluded by quota or failure state; try the next one.
    #[error("provider {0} is unavailable")]
    ProviderUnavailable(ProviderId),

    /// A completion attempt failed; recorded as an outcome, triggers fallback.
    #[error("provider {provider} request failed: {kind:?}")]
    Request {
        provider: ProviderId,
        kind: FailureKind,
    },

    /// The full fallback sequence was walked without success. Recovered by
    /// activating the hibernation bridge, not surfaced to the end user.
    #[error("all providers exhausted")]
    AllProvidersExhausted,

    /// Context validation failed after the re-compression retry. The
    /// conversation proceeds with best-effort context.
    #[error("context integrity mismatch: {reason}")]
    IntegrityMismatch { reason: String },

    /// The bridge exceeded its configured maximum lifetime. Fatal; the
    /// preserved snapshot remains available for manual recovery.
    #[error("hibernation bridge exceeded maximum duration ({elapsed_secs}s)")]
    BridgeTimeout { elapsed_secs: u64 },

    /// An illegal bridge state transition was requested.
    #[error("invalid bridge transition from {from} to {to}")]
    InvalidBridgeTransition { from: String, to: String },
}

impl RelayError {
    /// Whether this error is handled internally without user-visible impact.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable(_)
                | Self::Request { .. }
                | Self::AllProvidersExhausted
                | Self::IntegrityMismatch { .. }
        )
    }
}
