//! Tunable policy constants.
//!
//! Every threshold the orchestrator consults lives here with a serde
//! default, so operators can override any of them from configuration and
//! nothing in the engine hard-codes a magic number.

use serde::Deserialize;

const fn default_error_rate_weight() -> f64 {
    40.0
}
const fn default_failure_step() -> f64 {
    10.0
}
const fn default_failure_cap() -> f64 {
    30.0
}
const fn default_latency_weight() -> f64 {
    20.0
}
const fn default_latency_norm_ms() -> f64 {
    5_000.0
}
const fn default_quota_weight() -> f64 {
    10.0
}
const fn default_preference_bonus() -> f64 {
    10.0
}

/// Weights for the provider usage score. Terms sum to 100 at their caps;
/// lower scores are better.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    /// Points contributed by a 100% error rate.
    pub error_rate: f64,
    /// Points added per consecutive failure.
    pub consecutive_failure_step: f64,
    /// Ceiling on the consecutive-failure term.
    pub consecutive_failure_cap: f64,
    /// Points contributed at `latency_norm_ms` average latency.
    pub latency: f64,
    /// Latency that earns the full latency penalty.
    pub latency_norm_ms: f64,
    /// Points contributed at 100% quota consumption.
    pub quota: f64,
    /// Maximum points subtracted for a fully-preferred provider.
    pub preference_bonus: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            error_rate: default_error_rate_weight(),
            consecutive_failure_step: default_failure_step(),
            consecutive_failure_cap: default_failure_cap(),
            latency: default_latency_weight(),
            latency_norm_ms: default_latency_norm_ms(),
            quota: default_quota_weight(),
            preference_bonus: default_preference_bonus(),
        }
    }
}

const fn default_unavailable_after() -> u32 {
    3
}
const fn default_large_context_bonus() -> f64 {
    15.0
}

/// Policy for ranking and filtering providers.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SelectionPolicy {
    /// Consecutive failures since the last success that mark a provider
    /// unavailable regardless of score.
    pub unavailable_after: u32,
    /// Maximum points subtracted when `need_large_context` is set, scaled by
    /// `context_window / max_context_window`.
    pub large_context_bonus: f64,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            unavailable_after: default_unavailable_after(),
            large_context_bonus: default_large_context_bonus(),
        }
    }
}

const fn default_trigger_ratio() -> f64 {
    0.80
}
const fn default_budget_fraction() -> f64 {
    0.15
}
const fn default_budget_cap() -> u32 {
    300
}
const fn default_budget_floor() -> u32 {
    40
}
const fn default_response_cap() -> u32 {
    2_048
}
const fn default_tolerance() -> f64 {
    0.10
}
const fn default_retry_budget_multiplier() -> f64 {
    1.5
}

/// Policy for predictive handoffs and context compression.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct HandoffPolicy {
    /// Predicted usage ratio at which a handoff triggers.
    pub trigger_ratio: f64,
    /// Fraction of the target window granted to compressed context.
    pub budget_fraction: f64,
    /// Absolute cap on the compression budget, in tokens.
    pub budget_cap: u32,
    /// Floor for very small target windows, in tokens.
    pub budget_floor: u32,
    /// Ceiling on predicted response size, in tokens.
    pub predicted_response_cap: u32,
    /// Relative token-delta tolerance for integrity validation.
    pub validation_tolerance: f64,
    /// Budget growth factor for the single re-compression retry.
    pub retry_budget_multiplier: f64,
    pub split: CompressionSplit,
}

impl Default for HandoffPolicy {
    fn default() -> Self {
        Self {
            trigger_ratio: default_trigger_ratio(),
            budget_fraction: default_budget_fraction(),
            budget_cap: default_budget_cap(),
            budget_floor: default_budget_floor(),
            predicted_response_cap: default_response_cap(),
            validation_tolerance: default_tolerance(),
            retry_budget_multiplier: default_retry_budget_multiplier(),
            split: CompressionSplit::default(),
        }
    }
}

impl HandoffPolicy {
    /// Token budget for compressed context carried to `target_window`.
    ///
    /// `clamp(budget_fraction * target_window, budget_floor, budget_cap)`.
    #[must_use]
    pub fn compression_budget(&self, target_window: u32) -> u32 {
        let fraction = (f64::from(target_window) * self.budget_fraction) as u32;
        fraction.clamp(self.budget_floor, self.budget_cap)
    }
}

const fn default_technical() -> f64 {
    0.45
}
const fn default_project() -> f64 {
    0.30
}
const fn default_flow() -> f64 {
    0.20
}
const fn default_metadata() -> f64 {
    0.05
}

/// Allocation of the compression budget across context sections.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct CompressionSplit {
    pub technical: f64,
    pub project: f64,
    pub flow: f64,
    pub metadata: f64,
}

impl Default for CompressionSplit {
    fn default() -> Self {
        Self {
            technical: default_technical(),
            project: default_project(),
            flow: default_flow(),
            metadata: default_metadata(),
        }
    }
}

const fn default_check_interval_secs() -> u64 {
    60
}
const fn default_max_duration_secs() -> u64 {
    3_600
}
const fn default_recovery_estimate_secs() -> u64 {
    300
}

/// Policy for the hibernation bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgePolicy {
    /// Seconds between availability polls while hibernating.
    pub check_interval_secs: u64,
    /// Maximum bridge lifetime before the session is surfaced as fatal.
    pub max_duration_secs: u64,
    /// Conservative recovery estimate when no quota reset is imminent.
    pub recovery_estimate_secs: u64,
}

impl Default for BridgePolicy {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            max_duration_secs: default_max_duration_secs(),
            recovery_estimate_secs: default_recovery_estimate_secs(),
        }
    }
}

/// All orchestrator policy in one place.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelayPolicy {
    pub weights: ScoreWeights,
    pub selection: SelectionPolicy,
    pub handoff: HandoffPolicy,
    pub bridge: BridgePolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_sum_to_one_hundred_at_caps() {
        let w = ScoreWeights::default();
        let total = w.error_rate + w.consecutive_failure_cap + w.latency + w.quota;
        assert!((total - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn compression_budget_is_capped() {
        let policy = HandoffPolicy::default();
        // 15% of 131072 would be 19660; capped at 300.
        assert_eq!(policy.compression_budget(131_072), 300);
    }

    #[test]
    fn compression_budget_is_floored_for_tiny_windows() {
        let policy = HandoffPolicy::default();
        // 15% of 128 would be 19; floored at 40.
        assert_eq!(policy.compression_budget(128), 40);
    }

    #[test]
    fn compression_budget_uses_fraction_in_between() {
        let policy = HandoffPolicy::default();
        // 15% of 1024 = 153.
        assert_eq!(policy.compression_budget(1_024), 153);
    }

    #[test]
    fn default_split_sums_to_one() {
        let s = CompressionSplit::default();
        let total = s.technical + s.project + s.flow + s.metadata;
        assert!((total - 1.0).abs() < 1e-9);
    }
}
