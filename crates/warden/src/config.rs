//! Pipeline configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config
//! file:
//!
//! ```json
//! {
//!   "max_review_rounds": 3,
//!   "limits": { "max_operations": 1000000, "timeout": 5000 },
//!   "provider": { "model": "gpt-4o-mini", "api_key_env": "OPENAI_API_KEY" }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::limits::{ResourceLimits, duration_ms};

/// Errors loading a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that was read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// The file is not valid config JSON
    #[error("invalid config file {path}: {source}")]
    Parse {
        /// Path that was read
        path: PathBuf,
        /// Underlying error
        source: serde_json::Error,
    },
}

/// Settings for the chat-completions text generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// API root, without the `/chat/completions` suffix
    pub base_url: String,
    /// Model name
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Completion token cap
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
    /// Request timeout
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_tokens: 500,
            temperature: 0.7,
            timeout: Duration::from_secs(60),
        }
    }
}

impl ProviderConfig {
    /// The API key from the configured environment variable, if set and
    /// non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

/// Configuration for a [`Pipeline`](crate::pipeline::Pipeline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Reviews allowed per request; a rejection in the last one gives up
    pub max_review_rounds: u32,
    /// Budget for each sandbox run
    pub limits: ResourceLimits,
    /// Text generation settings
    pub provider: ProviderConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_review_rounds: 3,
            limits: ResourceLimits::default(),
            provider: ProviderConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_review_rounds, 3);
        assert_eq!(config.provider.model, "gpt-4o-mini");
        assert_eq!(config.provider.max_tokens, 500);
        assert_eq!(config.limits, ResourceLimits::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = serde_json::json!({
            "max_review_rounds": 5,
            "limits": {"timeout": 250},
            "provider": {"model": "m"},
        });
        file.write_all(json.to_string().as_bytes()).unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_review_rounds, 5);
        assert_eq!(config.limits.timeout, Duration::from_millis(250));
        assert_eq!(config.limits.max_call_depth, 200);
        assert_eq!(config.provider.model, "m");
        assert_eq!(config.provider.api_key_env, "OPENAI_API_KEY");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = PipelineConfig::from_file(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = PipelineConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_api_key_ignores_blank_values() {
        let config = ProviderConfig {
            api_key_env: "WARDEN_TEST_SURELY_UNSET_KEY".to_string(),
            ..ProviderConfig::default()
        };
        assert_eq!(config.api_key(), None);
    }
}
