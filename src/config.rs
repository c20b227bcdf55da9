//! Run configuration: provider selection, credentials, models, batching knobs.
//!
//! Resolution order is defaults, then the TOML file (if any), then environment
//! variables. Validation happens once, after all three layers are applied.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::gateway::{ChatModel, ProviderKind, DEFAULT_TIMEOUT};
use crate::grouping::{DEFAULT_BATCH_SIZE, DEFAULT_MIN_CONTEXT_SIZE};
use crate::text_normalize::DEFAULT_MAX_FIELD_CHARS;

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";

/// Shortest timeout accepted; batch judgments are slow.
pub const MIN_TIMEOUT_SECONDS: u64 = 120;

pub const ENV_PROVIDER: &str = "DECKPRIO_PROVIDER";
pub const ENV_OPENAI_KEY: &str = "OPENAI_API_KEY";
pub const ENV_GEMINI_KEY: &str = "GEMINI_API_KEY";
pub const ENV_BATCH_SIZE: &str = "DECKPRIO_BATCH_SIZE";
pub const ENV_CONFIG_PATH: &str = "DECKPRIO_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
    #[error("no API key for {provider}; set `{key}` in the config file or the {env} environment variable")]
    MissingApiKey {
        provider: &'static str,
        key: &'static str,
        env: &'static str,
    },
}

/// Everything a run needs to know before it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub provider: ProviderKind,
    pub openai_api_key: String,
    pub gemini_api_key: String,
    pub openai_model: String,
    pub gemini_model: String,
    pub batch_size: usize,
    pub min_context_size: usize,
    pub timeout_seconds: u64,
    pub max_field_chars: usize,
    pub openai_base_url: Option<String>,
    pub gemini_base_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            openai_api_key: String::new(),
            gemini_api_key: String::new(),
            openai_model: DEFAULT_OPENAI_MODEL.to_string(),
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            min_context_size: DEFAULT_MIN_CONTEXT_SIZE,
            timeout_seconds: DEFAULT_TIMEOUT.as_secs(),
            max_field_chars: DEFAULT_MAX_FIELD_CHARS,
            openai_base_url: None,
            gemini_base_url: None,
        }
    }
}

/// The provider a run will actually talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveProvider {
    pub kind: ProviderKind,
    pub api_key: String,
    pub model: ChatModel,
    pub base_url: Option<String>,
}

impl Config {
    /// Load from `path` (or `DECKPRIO_CONFIG`, or nothing), apply environment
    /// overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var_os(ENV_CONFIG_PATH).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. A missing file yields defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e: toml::de::Error| e.to_string())
    }

    /// Apply overrides from an environment lookup. Blank values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(provider) = get(ENV_PROVIDER) {
            self.provider = provider
                .parse()
                .map_err(|message| ConfigError::Invalid {
                    key: ENV_PROVIDER,
                    message,
                })?;
        }
        if let Some(key) = get(ENV_OPENAI_KEY) {
            self.openai_api_key = key;
        }
        if let Some(key) = get(ENV_GEMINI_KEY) {
            self.gemini_api_key = key;
        }
        if let Some(size) = get(ENV_BATCH_SIZE) {
            self.batch_size = size.trim().parse().map_err(|e| ConfigError::Invalid {
                key: ENV_BATCH_SIZE,
                message: format!("{size:?}: {e}"),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "batch_size",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.min_context_size == 0 {
            return Err(ConfigError::Invalid {
                key: "min_context_size",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.timeout_seconds < MIN_TIMEOUT_SECONDS {
            return Err(ConfigError::Invalid {
                key: "timeout_seconds",
                message: format!(
                    "{} is too short; use at least {MIN_TIMEOUT_SECONDS}",
                    self.timeout_seconds
                ),
            });
        }
        if self.max_field_chars == 0 {
            return Err(ConfigError::Invalid {
                key: "max_field_chars",
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Resolve provider, credential and model for the selected backend.
    pub fn active_provider(&self) -> Result<ActiveProvider, ConfigError> {
        let (api_key, model, base_url, key, env) = match self.provider {
            ProviderKind::OpenAi => (
                &self.openai_api_key,
                &self.openai_model,
                &self.openai_base_url,
                "openai_api_key",
                ENV_OPENAI_KEY,
            ),
            ProviderKind::Gemini => (
                &self.gemini_api_key,
                &self.gemini_model,
                &self.gemini_base_url,
                "gemini_api_key",
                ENV_GEMINI_KEY,
            ),
        };

        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(ConfigError::MissingApiKey {
                provider: self.provider.label(),
                key,
                env,
            });
        }
        let model = model.trim();
        if model.is_empty() {
            return Err(ConfigError::Invalid {
                key: match self.provider {
                    ProviderKind::OpenAi => "openai_model",
                    ProviderKind::Gemini => "gemini_model",
                },
                message: "model name is empty".to_string(),
            });
        }

        Ok(ActiveProvider {
            kind: self.provider,
            api_key: api_key.to_string(),
            model: ChatModel::new(self.provider, model),
            base_url: base_url.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.provider, ProviderKind::OpenAi);
        assert_eq!(c.openai_model, "gpt-4o-mini");
        assert_eq!(c.gemini_model, "gemini-1.5-flash");
        assert_eq!(c.batch_size, 10);
        assert_eq!(c.min_context_size, 10);
        assert_eq!(c.timeout_seconds, 180);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c = Config::from_toml_str(
            r#"
            provider = "gemini"
            gemini_api_key = "g-key"
            batch_size = 5
            "#,
        )
        .unwrap();
        assert_eq!(c.provider, ProviderKind::Gemini);
        assert_eq!(c.batch_size, 5);
        assert_eq!(c.gemini_model, DEFAULT_GEMINI_MODEL);
    }

    #[test]
    fn provider_in_file_is_case_insensitive() {
        for raw in ["Gemini", "GEMINI", " gemini "] {
            let c = Config::from_toml_str(&format!("provider = \"{raw}\"")).unwrap();
            assert_eq!(c.provider, ProviderKind::Gemini);
        }
        let c = Config::from_toml_str(r#"provider = "OpenAI""#).unwrap();
        assert_eq!(c.provider, ProviderKind::OpenAi);
    }

    #[test]
    fn unknown_keys_and_providers_are_rejected() {
        assert!(Config::from_toml_str("bogus = 1").is_err());
        assert!(Config::from_toml_str(r#"provider = "claude""#).is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut c = Config::default();
        c.apply_env(env(&[
            (ENV_PROVIDER, "Gemini"),
            (ENV_GEMINI_KEY, "from-env"),
            (ENV_BATCH_SIZE, "7"),
            (ENV_OPENAI_KEY, "   "),
        ]))
        .unwrap();
        assert_eq!(c.provider, ProviderKind::Gemini);
        assert_eq!(c.gemini_api_key, "from-env");
        assert_eq!(c.batch_size, 7);
        assert!(c.openai_api_key.is_empty());
    }

    #[test]
    fn bad_env_values_are_config_errors() {
        let mut c = Config::default();
        let err = c.apply_env(env(&[(ENV_BATCH_SIZE, "ten")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_BATCH_SIZE, .. }));

        let err = c.apply_env(env(&[(ENV_PROVIDER, "claude")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_PROVIDER, .. }));
    }

    #[test]
    fn validation_rejects_zero_batch_and_short_timeout() {
        let c = Config {
            batch_size: 0,
            ..Config::default()
        };
        assert!(c.validate().is_err());

        let c = Config {
            timeout_seconds: 60,
            ..Config::default()
        };
        assert!(matches!(
            c.validate(),
            Err(ConfigError::Invalid {
                key: "timeout_seconds",
                ..
            })
        ));
    }

    #[test]
    fn missing_key_names_provider_and_variable() {
        let c = Config {
            provider: ProviderKind::Gemini,
            openai_api_key: "sk-unused".into(),
            ..Config::default()
        };
        let err = c.active_provider().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Google Gemini"));
        assert!(msg.contains(ENV_GEMINI_KEY));
    }

    #[test]
    fn active_provider_resolves_model_and_base_url() {
        let c = Config {
            openai_api_key: " sk-test ".into(),
            openai_base_url: Some("http://localhost:1/v1".into()),
            ..Config::default()
        };
        let active = c.active_provider().unwrap();
        assert_eq!(active.kind, ProviderKind::OpenAi);
        assert_eq!(active.api_key, "sk-test");
        assert_eq!(active.model, ChatModel::OpenAi("gpt-4o-mini".into()));
        assert_eq!(active.base_url.as_deref(), Some("http://localhost:1/v1"));
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let c = Config::from_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(c, Config::default());
    }
}
