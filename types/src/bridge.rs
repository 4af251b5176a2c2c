use std::fmt;

use thiserror::Error;

/// Lifecycle of a hibernation episode.
///
/// Transitions are monotonic except for the failed-recovery loop:
///
/// ```text
/// Inactive -> Activated -> Recovering -> Restored
///                 ^------------/
/// ```
///
/// No transition may skip a state; [`BridgeState::can_transition_to`] is the
/// single authority consulted before any state change is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    Inactive,
    Activated,
    Recovering,
    Restored,
}

impl BridgeState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Activated => "activated",
            Self::Recovering => "recovering",
            Self::Restored => "restored",
        }
    }

    pub fn parse(value: &str) -> Result<Self, BridgeStateParseError> {
        match value {
            "inactive" => Ok(Self::Inactive),
            "activated" => Ok(Self::Activated),
            "recovering" => Ok(Self::Recovering),
            "restored" => Ok(Self::Restored),
            other => Err(BridgeStateParseError {
                value: other.to_string(),
            }),
        }
    }

    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Inactive, Self::Activated)
                | (Self::Activated, Self::Recovering)
                | (Self::Recovering, Self::Restored)
                | (Self::Recovering, Self::Activated)
        )
    }

    /// Terminal states accept no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Restored)
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown bridge state: {value}")]
pub struct BridgeStateParseError {
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_are_legal() {
        assert!(BridgeState::Inactive.can_transition_to(BridgeState::Activated));
        assert!(BridgeState::Activated.can_transition_to(BridgeState::Recovering));
        assert!(BridgeState::Recovering.can_transition_to(BridgeState::Restored));
    }

    #[test]
    fn failed_recovery_returns_to_activated() {
        assert!(BridgeState::Recovering.can_transition_to(BridgeState::Activated));
    }

    #[test]
    fn no_transition_skips_a_state() {
        assert!(!BridgeState::Inactive.can_transition_to(BridgeState::Recovering));
        assert!(!BridgeState::Inactive.can_transition_to(BridgeState::Restored));
        assert!(!BridgeState::Activated.can_transition_to(BridgeState::Restored));
    }

    #[test]
    fn restored_is_terminal() {
        assert!(BridgeState::Restored.is_terminal());
        assert!(!BridgeState::Restored.can_transition_to(BridgeState::Activated));
        assert!(!BridgeState::Restored.can_transition_to(BridgeState::Recovering));
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in [
            BridgeState::Inactive,
            BridgeState::Activated,
            BridgeState::Recovering,
            BridgeState::Restored,
        ] {
            assert_eq!(BridgeState::parse(state.as_str()).unwrap(), state);
        }
        assert!(BridgeState::parse("dormant").is_err());
    }
}
