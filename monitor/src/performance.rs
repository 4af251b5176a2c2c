//! Provider performance scoring.
//!
//! Every provider carries a usage score in `[0, 100]`, lower is better.
//! The score aggregates the rolling 24-hour window of the outcome log:
//!
//! - error rate, up to `weights.error_rate` points
//! - consecutive failures, `consecutive_failure_step` points each, capped
//! - average success latency, normalized against `latency_norm_ms`
//! - daily quota consumption, up to `weights.quota` points
//!
//! An operator preference subtracts up to `weights.preference_bonus` points.
//! A provider at or past `unavailable_after` consecutive failures scores the
//! maximum regardless of the other terms.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use relay_types::{ProviderId, ProviderSpec, RequestOutcome, ScoreWeights, SelectionPolicy};

use crate::store::{OutcomeStore, TodayUsage};

/// Hours of outcome history a score considers.
const SCORE_WINDOW_HOURS: i64 = 24;

/// Everything known about one provider's recent behavior.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderStats {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub is_available: bool,
    pub requests_today: u32,
    pub tokens_today: u64,
}

/// Scores providers from the outcome log.
///
/// Scores are cached per provider and invalidated by `record`, so a burst
/// of selections between outcomes costs one set of aggregate queries.
pub struct PerformanceMonitor<S> {
    store: S,
    weights: ScoreWeights,
    policy: SelectionPolicy,
    score_cache: HashMap<ProviderId, f64>,
}

impl<S: OutcomeStore> PerformanceMonitor<S> {
    #[must_use]
    pub fn new(store: S, weights: ScoreWeights, policy: SelectionPolicy) -> Self {
        Self {
            store,
            weights,
            policy,
            score_cache: HashMap::new(),
        }
    }

    /// Appends an outcome and invalidates the provider's cached score.
    pub fn record(&mut self, outcome: &RequestOutcome) -> Result<()> {
        self.store.record(outcome)?;
        self.score_cache.remove(&outcome.provider_id);
        tracing::debug!(
            provider = %outcome.provider_id,
            success = outcome.success,
            latency_ms = outcome.latency_ms,
            error_kind = ?outcome.error_kind,
            "outcome recorded"
        );
        Ok(())
    }

    /// Full stats view for one provider.
    pub fn stats(&self, provider: &ProviderId) -> Result<ProviderStats> {
        let since = Utc::now() - Duration::hours(SCORE_WINDOW_HOURS);
        let window = self.store.window_stats(provider, since)?;
        let consecutive_failures = self.store.consecutive_failures(provider)?;
        let usage = self.store.today_usage(provider)?;

        Ok(ProviderStats {
            total_requests: window.total_requests,
            successes: window.successes,
            failures: window.failures,
            success_rate: window.success_rate(),
            error_rate: window.error_rate(),
            avg_latency_ms: window.avg_latency_ms,
            last_success: window.last_success,
            last_failure: window.last_failure,
            consecutive_failures,
            is_available: consecutive_failures < self.policy.unavailable_after,
            requests_today: usage.requests,
            tokens_today: usage.tokens,
        })
    }

    /// Usage score in `[0, 100]`, lower is better. Cached until the next
    /// recorded outcome for this provider.
    pub fn score(&mut self, spec: &ProviderSpec) -> Result<f64> {
        if let Some(cached) = self.score_cache.get(&spec.id) {
            return Ok(*cached);
        }

        let stats = self.stats(&spec.id)?;
        let score = self.compute_score(spec, &stats);
        self.score_cache.insert(spec.id.clone(), score);
        Ok(score)
    }

    /// Whether the provider has reached the consecutive-failure cutoff or
    /// exhausted its daily quota.
    pub fn is_selectable(&self, spec: &ProviderSpec) -> Result<bool> {
        let failures = self.store.consecutive_failures(&spec.id)?;
        if failures >= self.policy.unavailable_after {
            return Ok(false);
        }
        Ok(!self.at_quota(spec, self.store.today_usage(&spec.id)?))
    }

    pub(crate) fn selection_policy(&self) -> &SelectionPolicy {
        &self.policy
    }

    fn at_quota(&self, spec: &ProviderSpec, usage: TodayUsage) -> bool {
        spec.daily_quota.is_some_and(|q| usage.requests >= q)
    }

    fn compute_score(&self, spec: &ProviderSpec, stats: &ProviderStats) -> f64 {
        if !stats.is_available {
            return 100.0;
        }

        let w = &self.weights;

        let error_score = stats.error_rate * w.error_rate;
        let failure_score = (f64::from(stats.consecutive_failures)
            * w.consecutive_failure_step)
            .min(w.consecutive_failure_cap);
        let latency_score = (stats.avg_latency_ms / w.latency_norm_ms * w.latency).min(w.latency);
        let quota_score = spec.daily_quota.map_or(0.0, |quota| {
            if quota == 0 {
                0.0
            } else {
                f64::from(stats.requests_today) / f64::from(quota) * w.quota
            }
        });
        let preference = spec.preference_weight * w.preference_bonus;

        (error_score + failure_score + latency_score + quota_score - preference).clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryOutcomeStore;
    use relay_types::FailureKind;

    fn monitor() -> PerformanceMonitor<MemoryOutcomeStore> {
        PerformanceMonitor::new(
            MemoryOutcomeStore::new(),
            ScoreWeights::default(),
            SelectionPolicy::default(),
        )
    }

    fn spec(id: &str) -> ProviderSpec {
        ProviderSpec::new(id, 32_768)
    }

    #[test]
    fn fresh_provider_scores_zero() {
        let mut monitor = monitor();
        let score = monitor.score(&spec("fresh")).expect("score");
        assert!((score - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn failures_raise_the_score() {
        let mut monitor = monitor();
        let spec = spec("flaky");

        monitor
            .record(&RequestOutcome::success(spec.id.clone(), 100, 10))
            .expect("record");
        let healthy = monitor.score(&spec).expect("score");

        monitor
            .record(&RequestOutcome::failure(
                spec.id.clone(),
                100,
                FailureKind::Timeout,
            ))
            .expect("record");
        let degraded = monitor.score(&spec).expect("score");

        assert!(degraded > healthy);
        // 50% error rate (20) + one consecutive failure (10).
        assert!((degraded - 30.0).abs() < 1.0);
    }

    #[test]
    fn three_consecutive_failures_score_maximum() {
        let mut monitor = monitor();
        let spec = spec("down");

        for _ in 0..3 {
            monitor
                .record(&RequestOutcome::failure(
                    spec.id.clone(),
                    0,
                    FailureKind::RateLimited,
                ))
                .expect("record");
        }

        assert!((monitor.score(&spec).expect("score") - 100.0).abs() < f64::EPSILON);
        assert!(!monitor.is_selectable(&spec).expect("selectable"));
        assert!(!monitor.stats(&spec.id).expect("stats").is_available);
    }

    #[test]
    fn success_after_failures_restores_availability() {
        let mut monitor = monitor();
        let spec = spec("recovering");

        for _ in 0..3 {
            monitor
                .record(&RequestOutcome::failure(
                    spec.id.clone(),
                    0,
                    FailureKind::Unknown,
                ))
                .expect("record");
        }
        monitor
            .record(&RequestOutcome::success(spec.id.clone(), 100, 10))
            .expect("record");

        let stats = monitor.stats(&spec.id).expect("stats");
        assert_eq!(stats.consecutive_failures, 0);
        assert!(stats.is_available);
        assert!(monitor.score(&spec).expect("score") < 100.0);
    }

    #[test]
    fn latency_contributes_up_to_its_cap() {
        let mut monitor = monitor();
        let spec = spec("slow");

        // 10s average latency; the latency term caps at 20.
        monitor
            .record(&RequestOutcome::success(spec.id.clone(), 10_000, 10))
            .expect("record");

        let score = monitor.score(&spec).expect("score");
        assert!((score - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn quota_consumption_contributes_proportionally() {
        let mut monitor = monitor();
        let spec = spec("limited").with_daily_quota(10);

        for _ in 0..5 {
            monitor
                .record(&RequestOutcome::success(spec.id.clone(), 0, 1))
                .expect("record");
        }

        // Half the quota consumed: 5 of 10 points.
        let score = monitor.score(&spec).expect("score");
        assert!((score - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn exhausted_quota_makes_provider_unselectable() {
        let mut monitor = monitor();
        let spec = spec("capped").with_daily_quota(2);

        for _ in 0..2 {
            monitor
                .record(&RequestOutcome::success(spec.id.clone(), 0, 1))
                .expect("record");
        }

        assert!(!monitor.is_selectable(&spec).expect("selectable"));
    }

    #[test]
    fn preference_subtracts_but_never_goes_negative() {
        let mut monitor = monitor();
        let preferred = spec("preferred").with_preference(1.0);

        let score = monitor.score(&preferred).expect("score");
        assert!((score - 0.0).abs() < f64::EPSILON);

        // With some penalty on the board the bonus shows through.
        monitor
            .record(&RequestOutcome::failure(
                preferred.id.clone(),
                0,
                FailureKind::Timeout,
            ))
            .expect("record");
        let mut plain_monitor = self::monitor();
        let plain = spec("preferred");
        plain_monitor
            .record(&RequestOutcome::failure(
                plain.id.clone(),
                0,
                FailureKind::Timeout,
            ))
            .expect("record");

        let preferred_score = monitor.score(&preferred).expect("score");
        let plain_score = plain_monitor.score(&plain).expect("score");
        assert!(preferred_score < plain_score);
    }

    #[test]
    fn score_is_cached_until_next_record() {
        let mut monitor = monitor();
        let spec = spec("cached");

        let first = monitor.score(&spec).expect("score");
        assert_eq!(monitor.score(&spec).expect("score"), first);

        monitor
            .record(&RequestOutcome::failure(
                spec.id.clone(),
                0,
                FailureKind::Timeout,
            ))
            .expect("record");
        assert!(monitor.score(&spec).expect("score") > first);
    }
}
