use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::ids::ProviderId;

/// Static description of a callable completion backend.
///
/// Registered once at startup from configuration and immutable for the
/// process lifetime. Everything dynamic about a provider (scores,
/// availability, usage) is derived from the outcome log, never stored here.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProviderSpec {
    pub id: ProviderId,
    pub display_name: String,
    /// Maximum token budget for input + output combined.
    pub context_window: u32,
    /// Requests per day, or `None` for unbounded.
    pub daily_quota: Option<u32>,
    #[serde(default)]
    pub capability_tags: BTreeSet<String>,
    /// Operator-declared preference in `[0.0, 1.0]`; higher is preferred.
    #[serde(default)]
    pub preference_weight: f64,
}

impl ProviderSpec {
    #[must_use]
    pub fn new(id: impl Into<String>, context_window: u32) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id: ProviderId::new(id),
            context_window,
            daily_quota: None,
            capability_tags: BTreeSet::new(),
            preference_weight: 0.0,
        }
    }

    #[must_use]
    pub fn with_daily_quota(mut self, quota: u32) -> Self {
        self.daily_quota = Some(quota);
        self
    }

    #[must_use]
    pub fn with_preference(mut self, weight: f64) -> Self {
        self.preference_weight = weight.clamp(0.0, 1.0);
        self
    }
}

/// Immutable set of providers registered at startup.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<ProviderSpec>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new(providers: Vec<ProviderSpec>) -> Self {
        Self { providers }
    }

    #[must_use]
    pub fn get(&self, id: &ProviderId) -> Option<&ProviderSpec> {
        self.providers.iter().find(|p| &p.id == id)
    }

    #[must_use]
    pub fn all(&self) -> &[ProviderSpec] {
        &self.providers
    }

    #[must_use]
    pub fn ids(&self) -> Vec<ProviderId> {
        self.providers.iter().map(|p| p.id.clone()).collect()
    }

    /// Largest context window across all registered providers.
    ///
    /// Used to normalize the large-context bonus during selection.
    #[must_use]
    pub fn max_context_window(&self) -> u32 {
        self.providers
            .iter()
            .map(|p| p.context_window)
            .max()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }
}

/// One provider switch event, retained for stats and audit.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HandoffRecord {
    pub from_provider: ProviderId,
    pub to_provider: ProviderId,
    /// Tokens in use on the source provider when the switch was decided.
    pub pre_tokens: u32,
    /// Predicted total had the conversation stayed on the source provider.
    pub predicted_tokens: u32,
    /// Tokens in the compressed context carried to the target.
    pub compressed_tokens: u32,
    pub reason: String,
    pub snapshot_checksum: String,
    pub timestamp: DateTime<Utc>,
}

impl HandoffRecord {
    /// Fraction of the pre-handoff context eliminated by compression.
    #[must_use]
    pub fn reduction_ratio(&self) -> f64 {
        if self.pre_tokens == 0 {
            return 0.0;
        }
        1.0 - f64::from(self.compressed_tokens) / f64::from(self.pre_tokens)
    }
}
