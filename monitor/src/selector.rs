//! Performance-ranked provider selection.

use anyhow::Result;
use relay_types::{ProviderId, ProviderRegistry, ProviderSpec};

use crate::performance::{PerformanceMonitor, ProviderStats};
use crate::store::OutcomeStore;

/// Outcome of a selection pass.
///
/// `NoneAvailable` is a sentinel, not an error: it is the signal that the
/// hibernation bridge takes over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Provider(ProviderId),
    NoneAvailable,
}

impl Selection {
    #[must_use]
    pub fn provider(&self) -> Option<&ProviderId> {
        match self {
            Self::Provider(id) => Some(id),
            Self::NoneAvailable => None,
        }
    }
}

/// One row of the ranking view.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedProvider {
    pub id: ProviderId,
    pub score: f64,
    pub stats: ProviderStats,
}

/// Ranks registered providers by usage score and picks the best selectable
/// one.
pub struct ProviderSelector<S> {
    registry: ProviderRegistry,
    monitor: PerformanceMonitor<S>,
}

impl<S: OutcomeStore> ProviderSelector<S> {
    #[must_use]
    pub fn new(registry: ProviderRegistry, monitor: PerformanceMonitor<S>) -> Self {
        Self { registry, monitor }
    }

    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn monitor_mut(&mut self) -> &mut PerformanceMonitor<S> {
        &mut self.monitor
    }

    #[must_use]
    pub fn monitor(&self) -> &PerformanceMonitor<S> {
        &self.monitor
    }

    /// Best selectable provider outside `exclude`, or `NoneAvailable`.
    ///
    /// With `need_large_context` set, a provider's score is reduced by the
    /// configured bonus scaled by its share of the largest registered
    /// context window, so bigger windows win ties against marginally
    /// better-scoring small ones.
    pub fn select(&mut self, exclude: &[ProviderId], need_large_context: bool) -> Result<Selection> {
        let ranked = self.ranked_candidates(exclude, need_large_context)?;

        match ranked.first() {
            Some((spec, score)) => {
                tracing::debug!(
                    provider = %spec.id,
                    score,
                    need_large_context,
                    "provider selected"
                );
                Ok(Selection::Provider(spec.id.clone()))
            }
            None => {
                tracing::warn!(
                    excluded = exclude.len(),
                    registered = self.registry.len(),
                    "no provider available"
                );
                Ok(Selection::NoneAvailable)
            }
        }
    }

    /// Full filtered ranking, best first. The fallback walk follows this
    /// sequence.
    pub fn fallback_sequence(&mut self, exclude: &[ProviderId]) -> Result<Vec<ProviderId>> {
        Ok(self
            .ranked_candidates(exclude, false)?
            .into_iter()
            .map(|(spec, _)| spec.id)
            .collect())
    }

    /// Ranking view over every registered provider, including unavailable
    /// ones, for stats reporting.
    pub fn rankings(&mut self) -> Result<Vec<RankedProvider>> {
        let specs: Vec<ProviderSpec> = self.registry.all().to_vec();
        let mut rows = Vec::with_capacity(specs.len());
        for spec in &specs {
            rows.push(RankedProvider {
                score: self.monitor.score(spec)?,
                stats: self.monitor.stats(&spec.id)?,
                id: spec.id.clone(),
            });
        }
        rows.sort_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then(a.stats.error_rate.total_cmp(&b.stats.error_rate))
        });
        Ok(rows)
    }

    fn ranked_candidates(
        &mut self,
        exclude: &[ProviderId],
        need_large_context: bool,
    ) -> Result<Vec<(ProviderSpec, f64)>> {
        let max_window = f64::from(self.registry.max_context_window().max(1));
        let bonus = self.monitor.selection_policy().large_context_bonus;
        let specs: Vec<ProviderSpec> = self.registry.all().to_vec();

        let mut candidates = Vec::new();
        for spec in specs {
            if exclude.contains(&spec.id) {
                continue;
            }
            if !self.monitor.is_selectable(&spec)? {
                continue;
            }

            let mut score = self.monitor.score(&spec)?;
            if need_large_context {
                score -= bonus * (f64::from(spec.context_window) / max_window);
            }
            candidates.push((spec, score));
        }

        candidates.sort_by(|a, b| a.1.total_cmp(&b.1));
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::performance::PerformanceMonitor;
    use crate::store::MemoryOutcomeStore;
    use relay_types::{FailureKind, RequestOutcome, ScoreWeights, SelectionPolicy};

    fn selector(specs: Vec<ProviderSpec>) -> ProviderSelector<MemoryOutcomeStore> {
        ProviderSelector::new(
            ProviderRegistry::new(specs),
            PerformanceMonitor::new(
                MemoryOutcomeStore::new(),
                ScoreWeights::default(),
                SelectionPolicy::default(),
            ),
        )
    }

    fn fail(selector: &mut ProviderSelector<MemoryOutcomeStore>, id: &ProviderId, times: u32) {
        for _ in 0..times {
            selector
                .monitor_mut()
                .record(&RequestOutcome::failure(
                    id.clone(),
                    0,
                    FailureKind::Timeout,
                ))
                .expect("record");
        }
    }

    #[test]
    fn selects_lowest_scoring_provider() {
        let mut selector = selector(vec![
            ProviderSpec::new("healthy", 32_768),
            ProviderSpec::new("flaky", 32_768),
        ]);
        fail(&mut selector, &ProviderId::from("flaky"), 1);

        let selection = selector.select(&[], false).expect("select");
        assert_eq!(selection, Selection::Provider(ProviderId::from("healthy")));
    }

    #[test]
    fn excluded_providers_are_skipped() {
        let mut selector = selector(vec![
            ProviderSpec::new("first", 32_768),
            ProviderSpec::new("second", 32_768),
        ]);

        let selection = selector
            .select(&[ProviderId::from("first")], false)
            .expect("select");
        assert_eq!(selection, Selection::Provider(ProviderId::from("second")));
    }

    #[test]
    fn unavailable_providers_are_skipped() {
        let mut selector = selector(vec![
            ProviderSpec::new("down", 32_768),
            ProviderSpec::new("up", 32_768),
        ]);
        fail(&mut selector, &ProviderId::from("down"), 3);

        let selection = selector.select(&[], false).expect("select");
        assert_eq!(selection, Selection::Provider(ProviderId::from("up")));
    }

    #[test]
    fn quota_exhausted_providers_are_skipped() {
        let mut selector = selector(vec![
            ProviderSpec::new("capped", 32_768).with_daily_quota(1),
            ProviderSpec::new("open", 32_768),
        ]);
        selector
            .monitor_mut()
            .record(&RequestOutcome::success(ProviderId::from("capped"), 0, 1))
            .expect("record");

        let selection = selector.select(&[], false).expect("select");
        assert_eq!(selection, Selection::Provider(ProviderId::from("open")));
    }

    #[test]
    fn total_exhaustion_returns_none_available() {
        let mut selector = selector(vec![
            ProviderSpec::new("a", 32_768),
            ProviderSpec::new("b", 32_768),
        ]);
        fail(&mut selector, &ProviderId::from("a"), 3);
        fail(&mut selector, &ProviderId::from("b"), 3);

        assert_eq!(
            selector.select(&[], false).expect("select"),
            Selection::NoneAvailable
        );
        assert!(selector.fallback_sequence(&[]).expect("sequence").is_empty());
    }

    #[test]
    fn large_context_bonus_prefers_wide_windows() {
        let mut selector = selector(vec![
            ProviderSpec::new("narrow", 8_192),
            ProviderSpec::new("wide", 131_072),
        ]);
        // Give the narrow provider a marginally better base score.
        selector
            .monitor_mut()
            .record(&RequestOutcome::success(ProviderId::from("narrow"), 50, 1))
            .expect("record");
        selector
            .monitor_mut()
            .record(&RequestOutcome::success(ProviderId::from("wide"), 500, 1))
            .expect("record");

        let plain = selector.select(&[], false).expect("select");
        assert_eq!(plain, Selection::Provider(ProviderId::from("narrow")));

        let large = selector.select(&[], true).expect("select");
        assert_eq!(large, Selection::Provider(ProviderId::from("wide")));
    }

    #[test]
    fn fallback_sequence_is_score_ordered() {
        let mut selector = selector(vec![
            ProviderSpec::new("worst", 32_768),
            ProviderSpec::new("best", 32_768),
            ProviderSpec::new("middle", 32_768),
        ]);
        fail(&mut selector, &ProviderId::from("worst"), 2);
        fail(&mut selector, &ProviderId::from("middle"), 1);

        let sequence = selector.fallback_sequence(&[]).expect("sequence");
        assert_eq!(
            sequence,
            vec![
                ProviderId::from("best"),
                ProviderId::from("middle"),
                ProviderId::from("worst"),
            ]
        );
    }

    #[test]
    fn rankings_include_unavailable_providers() {
        let mut selector = selector(vec![
            ProviderSpec::new("up", 32_768),
            ProviderSpec::new("down", 32_768),
        ]);
        fail(&mut selector, &ProviderId::from("down"), 3);

        let rankings = selector.rankings().expect("rankings");
        assert_eq!(rankings.len(), 2);
        assert_eq!(rankings[0].id, ProviderId::from("up"));
        assert!((rankings[1].score - 100.0).abs() < f64::EPSILON);
        assert!(!rankings[1].stats.is_available);
    }
}
