//! Configuration loading for Relay.
//!
//! Configuration lives at `~/.relay/config.toml`. Every section is
//! optional; a missing file is not an error, and the policy tables fall
//! back field-by-field to their built-in defaults. API keys support
//! `${ENV_VAR}` references so the file never has to hold a literal
//! secret.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::{env, fs};

use relay_types::{ProviderRegistry, ProviderSpec, RelayPolicy};
use serde::Deserialize;
use thiserror::Error;

const DATA_DIR_NAME: &str = ".relay";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config at {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The home directory could not be determined, so neither the config
    /// path nor the default data directory can be resolved.
    #[error("could not determine home directory")]
    NoHomeDir,
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Read { path, .. } | Self::Parse { path, .. } => Some(path),
            Self::NoHomeDir => None,
        }
    }
}

/// One `[[providers]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub display_name: Option<String>,
    pub context_window: u32,
    pub daily_quota: Option<u32>,
    #[serde(default)]
    pub capability_tags: Vec<String>,
    #[serde(default)]
    pub preference_weight: f64,
}

impl ProviderConfig {
    #[must_use]
    pub fn to_spec(&self) -> ProviderSpec {
        let mut spec = ProviderSpec::new(self.id.clone(), self.context_window)
            .with_preference(self.preference_weight);
        if let Some(quota) = self.daily_quota {
            spec = spec.with_daily_quota(quota);
        }
        if let Some(name) = &self.display_name {
            spec.display_name.clone_from(name);
        }
        spec.capability_tags = self
            .capability_tags
            .iter()
            .cloned()
            .collect::<BTreeSet<String>>();
        spec
    }
}

/// The `[client]` section: where completions are sent.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub base_url: String,
    /// Literal key or a `${ENV_VAR}` reference.
    pub api_key: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

impl ClientConfig {
    /// API key with `${ENV_VAR}` references expanded; `None` when the
    /// expansion comes out empty.
    #[must_use]
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .as_deref()
            .map(expand_env_vars)
            .filter(|key| !key.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Overrides the default `~/.relay` data directory.
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub policy: RelayPolicy,
    pub client: Option<ClientConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl RelayConfig {
    /// Loads `~/.relay/config.toml`; `Ok(None)` when it does not exist.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    /// Loads an explicit config file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|err| {
            tracing::warn!(path = %path.display(), %err, "failed to read config");
            ConfigError::Read {
                path: path.to_path_buf(),
                source: err,
            }
        })?;

        toml::from_str(&content).map_err(|err| {
            tracing::warn!(path = %path.display(), %err, "failed to parse config");
            ConfigError::Parse {
                path: path.to_path_buf(),
                source: err,
            }
        })
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// Registry of every configured provider, in file order.
    #[must_use]
    pub fn registry(&self) -> ProviderRegistry {
        ProviderRegistry::new(self.providers.iter().map(ProviderConfig::to_spec).collect())
    }

    /// Data directory holding the SQLite stores.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.storage.data_dir {
            return Ok(dir.clone());
        }
        dirs::home_dir()
            .map(|home| home.join(DATA_DIR_NAME))
            .ok_or(ConfigError::NoHomeDir)
    }

    pub fn outcomes_db_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join("outcomes.db"))
    }

    pub fn integrity_db_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join("integrity.db"))
    }

    pub fn bridge_db_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join("bridge.db"))
    }
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DATA_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Expands `${VAR}` references against the process environment. Missing
/// variables expand to the empty string; an unclosed brace is left as-is.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut i = 0;

    while i < value.len() {
        if value[i..].starts_with("${") {
            let start = i + 2;
            if let Some(end_rel) = value[start..].find('}') {
                let end = start + end_rel;
                let var = &value[start..end];
                if !var.is_empty() {
                    let replacement = env::var(var).unwrap_or_default();
                    out.push_str(&replacement);
                }
                i = end + 1;
                continue;
            }
        }

        // i < len, so there is always a next char.
        let Some(ch) = value[i..].chars().next() else {
            break;
        };
        out.push(ch);
        i += ch.len_utf8();
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_parses_with_defaults() {
        let config: RelayConfig = toml::from_str("").expect("parse");
        assert!(config.providers.is_empty());
        assert!(config.client.is_none());
        assert_eq!(config.policy, RelayPolicy::default());
        assert!(config.registry().is_empty());
    }

    #[test]
    fn providers_parse_in_file_order() {
        let config: RelayConfig = toml::from_str(
            r#"
[[providers]]
id = "mistralai/mistral-7b-instruct"
display_name = "Mistral 7B"
context_window = 32768
daily_quota = 50
capability_tags = ["general", "code"]
preference_weight = 0.8

[[providers]]
id = "meta-llama/llama-3-8b-instruct"
context_window = 8192
"#,
        )
        .expect("parse");

        let registry = config.registry();
        assert_eq!(registry.len(), 2);

        let specs = registry.all();
        assert_eq!(specs[0].display_name, "Mistral 7B");
        assert_eq!(specs[0].daily_quota, Some(50));
        assert!(specs[0].capability_tags.contains("code"));
        assert!((specs[0].preference_weight - 0.8).abs() < f64::EPSILON);

        assert_eq!(specs[1].display_name, "meta-llama/llama-3-8b-instruct");
        assert_eq!(specs[1].daily_quota, None);
    }

    #[test]
    fn out_of_range_preference_is_clamped() {
        let config: RelayConfig = toml::from_str(
            r#"
[[providers]]
id = "eager"
context_window = 4096
preference_weight = 3.5
"#,
        )
        .expect("parse");

        let spec = config.registry().all()[0].clone();
        assert!((spec.preference_weight - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_policy_override_keeps_other_defaults() {
        let config: RelayConfig = toml::from_str(
            r"
[policy.handoff]
trigger_ratio = 0.9

[policy.bridge]
check_interval_secs = 30
",
        )
        .expect("parse");

        assert!((config.policy.handoff.trigger_ratio - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.policy.handoff.budget_cap, 300);
        assert_eq!(config.policy.bridge.check_interval_secs, 30);
        assert_eq!(config.policy.bridge.max_duration_secs, 3_600);
    }

    #[test]
    fn client_section_resolves_env_key() {
        unsafe {
            env::set_var("RELAY_TEST_API_KEY", "sk-test-123");
        }
        let config: RelayConfig = toml::from_str(
            r#"
[client]
base_url = "https://openrouter.ai/api/v1"
api_key = "${RELAY_TEST_API_KEY}"
request_timeout_secs = 90
"#,
        )
        .expect("parse");

        let client = config.client.expect("client section");
        assert_eq!(client.resolved_api_key(), Some("sk-test-123".to_string()));
        assert_eq!(client.request_timeout_secs, Some(90));
        unsafe {
            env::remove_var("RELAY_TEST_API_KEY");
        }
    }

    #[test]
    fn missing_env_key_resolves_to_none() {
        unsafe {
            env::remove_var("RELAY_ABSENT_KEY");
        }
        let client = ClientConfig {
            base_url: "https://example.invalid".to_string(),
            api_key: Some("${RELAY_ABSENT_KEY}".to_string()),
            request_timeout_secs: None,
        };
        assert_eq!(client.resolved_api_key(), None);
    }

    #[test]
    fn storage_override_drives_db_paths() {
        let config: RelayConfig = toml::from_str(
            r#"
[storage]
data_dir = "/var/lib/relay"
"#,
        )
        .expect("parse");

        assert_eq!(
            config.outcomes_db_path().expect("path"),
            PathBuf::from("/var/lib/relay/outcomes.db")
        );
        assert_eq!(
            config.bridge_db_path().expect("path"),
            PathBuf::from("/var/lib/relay/bridge.db")
        );
    }

    #[test]
    fn load_from_reads_a_real_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[[providers]]
id = "local"
context_window = 16384
"#,
        )
        .expect("write");

        let config = RelayConfig::load_from(&path).expect("load");
        assert_eq!(config.registry().len(), 1);
    }

    #[test]
    fn load_from_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "not valid [ toml").expect("write");

        let err = RelayConfig::load_from(&path).expect_err("parse failure");
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), Some(path.as_path()));
    }

    #[test]
    fn expand_env_vars_single_var() {
        unsafe {
            env::set_var("RELAY_EXPAND_VAR", "replaced");
        }
        assert_eq!(
            expand_env_vars("prefix ${RELAY_EXPAND_VAR} suffix"),
            "prefix replaced suffix"
        );
        unsafe {
            env::remove_var("RELAY_EXPAND_VAR");
        }
    }

    #[test]
    fn expand_env_vars_missing_var_becomes_empty() {
        unsafe {
            env::remove_var("RELAY_MISSING_VAR");
        }
        assert_eq!(expand_env_vars("a ${RELAY_MISSING_VAR} b"), "a  b");
    }

    #[test]
    fn expand_env_vars_unclosed_brace_preserved() {
        assert_eq!(expand_env_vars("test ${UNCLOSED"), "test ${UNCLOSED");
    }

    #[test]
    fn expand_env_vars_adjacent_vars() {
        unsafe {
            env::set_var("RELAY_ADJ_A", "X");
            env::set_var("RELAY_ADJ_B", "Y");
        }
        assert_eq!(expand_env_vars("${RELAY_ADJ_A}${RELAY_ADJ_B}"), "XY");
        unsafe {
            env::remove_var("RELAY_ADJ_A");
            env::remove_var("RELAY_ADJ_B");
        }
    }
}
