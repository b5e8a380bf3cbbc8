//! Configuration for the remote embedding provider

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable consulted when no API token is configured explicitly.
pub const API_TOKEN_ENV: &str = "REPLICATE_API_TOKEN";

/// Default Replicate API base URL.
pub const DEFAULT_API_BASE: &str = "https://api.replicate.com/v1";

/// Default embedding model: BAAI bge-large-en-v1.5 hosted on Replicate.
pub const DEFAULT_MODEL_NAME: &str = "nateraw/bge-large-en-v1.5";

/// Pinned model version for [`DEFAULT_MODEL_NAME`].
pub const DEFAULT_MODEL_VERSION: &str =
    "9cf9f015a9cb9c61d1a2610659cdac4a4ca222f2d3707a68517b18c198a9add1";

/// Output width of bge-large-en-v1.5.
pub const DEFAULT_DIMENSION: usize = 1024;

/// Configuration for a Replicate-hosted embedding model.
///
/// The same configuration must be used when building an index and when embedding
/// queries against it; the model name and dimension are recorded with every index
/// generation and checked at query time.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    /// Base URL of the predictions API
    pub api_base: String,
    /// API token; falls back to `REPLICATE_API_TOKEN` when empty
    #[serde(skip_serializing)]
    pub api_token: String,
    /// Human-readable model identifier, recorded with each index generation
    pub model_name: String,
    /// Model version hash sent with every prediction
    pub model_version: String,
    /// Expected embedding width
    pub dimension: usize,
    /// Batch size the model uses internally while encoding one request
    pub provider_batch_size: usize,
    /// Ask the model to L2-normalize its output vectors
    pub normalize: bool,
    /// Per-HTTP-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Delay between prediction status polls in milliseconds
    pub poll_interval_ms: u64,
    /// Upper bound on the time spent waiting for one prediction, in seconds
    pub max_wait_secs: u64,
}

impl std::fmt::Debug for EmbedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbedConfig")
            .field("api_base", &self.api_base)
            .field("api_token", &"<redacted>")
            .field("model_name", &self.model_name)
            .field("model_version", &self.model_version)
            .field("dimension", &self.dimension)
            .field("provider_batch_size", &self.provider_batch_size)
            .field("normalize", &self.normalize)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("max_wait_secs", &self.max_wait_secs)
            .finish()
    }
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_token: String::new(),
            model_name: DEFAULT_MODEL_NAME.to_string(),
            model_version: DEFAULT_MODEL_VERSION.to_string(),
            dimension: DEFAULT_DIMENSION,
            provider_batch_size: 32,
            normalize: false,
            request_timeout_secs: 90,
            poll_interval_ms: 500,
            max_wait_secs: 300,
        }
    }
}

impl EmbedConfig {
    /// Set the API token (builder style)
    pub fn with_api_token<S: Into<String>>(self, api_token: S) -> Self {
        Self {
            api_token: api_token.into(),
            ..self
        }
    }

    /// Set the API base URL (builder style)
    pub fn with_api_base<S: Into<String>>(self, api_base: S) -> Self {
        Self {
            api_base: api_base.into(),
            ..self
        }
    }

    /// Set the model name and pinned version (builder style)
    pub fn with_model<N: Into<String>, V: Into<String>>(self, name: N, version: V) -> Self {
        Self {
            model_name: name.into(),
            model_version: version.into(),
            ..self
        }
    }

    /// Set the expected embedding dimension (builder style)
    pub fn with_dimension(self, dimension: usize) -> Self {
        Self { dimension, ..self }
    }

    /// Set whether the provider should normalize embeddings (builder style)
    pub fn with_normalize(self, normalize: bool) -> Self {
        Self { normalize, ..self }
    }

    /// Set the polling cadence and overall wait bound (builder style)
    pub fn with_polling(self, poll_interval: Duration, max_wait: Duration) -> Self {
        Self {
            poll_interval_ms: poll_interval.as_millis() as u64,
            max_wait_secs: max_wait.as_secs(),
            ..self
        }
    }

    /// Fill an empty API token from the `REPLICATE_API_TOKEN` environment variable.
    pub fn with_token_from_env(self) -> Self {
        if !self.api_token.trim().is_empty() {
            return self;
        }
        match std::env::var(API_TOKEN_ENV) {
            Ok(token) => self.with_api_token(token),
            Err(_) => self,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    /// Validate the configuration before any request is made
    pub fn validate(&self) -> Result<()> {
        if self.api_base.trim().is_empty() {
            return Err(EmbedError::invalid_config("api_base must not be empty"));
        }
        if self.api_token.trim().is_empty() {
            return Err(EmbedError::invalid_config(format!(
                "missing API token (set embedding.api_token or {API_TOKEN_ENV})"
            )));
        }
        if self.model_version.trim().is_empty() {
            return Err(EmbedError::invalid_config("model_version must not be empty"));
        }
        if self.dimension == 0 {
            return Err(EmbedError::invalid_config("dimension must be positive"));
        }
        if self.provider_batch_size == 0 {
            return Err(EmbedError::invalid_config(
                "provider_batch_size must be positive",
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(EmbedError::invalid_config("poll_interval_ms must be positive"));
        }

        tracing::debug!("Embedding configuration valid for: {}", self.model_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EmbedConfig::default();
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.model_name, "nateraw/bge-large-en-v1.5");
        assert_eq!(config.dimension, 1024);
        assert_eq!(config.provider_batch_size, 32);
        assert!(!config.normalize);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_builder_methods() {
        let config = EmbedConfig::default()
            .with_api_token("r8_test")
            .with_api_base("http://127.0.0.1:9999/v1")
            .with_model("acme/tiny-embed", "abc123")
            .with_dimension(8)
            .with_normalize(true)
            .with_polling(Duration::from_millis(10), Duration::from_secs(2));

        assert_eq!(config.api_token, "r8_test");
        assert_eq!(config.model_name, "acme/tiny-embed");
        assert_eq!(config.model_version, "abc123");
        assert_eq!(config.dimension, 8);
        assert!(config.normalize);
        assert_eq!(config.poll_interval_ms, 10);
        assert_eq!(config.max_wait(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_token() {
        let err = EmbedConfig::default().validate().unwrap_err();
        assert!(matches!(err, EmbedError::InvalidConfig { .. }));
    }

    #[test]
    fn test_validate_rejects_zero_dimension() {
        let config = EmbedConfig::default().with_api_token("t").with_dimension(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = EmbedConfig::default().with_api_token("r8_secret");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("r8_secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_deserialize_partial_toml_like_json() {
        let config: EmbedConfig =
            serde_json::from_str(r#"{"dimension": 384, "normalize": true}"#).unwrap();
        assert_eq!(config.dimension, 384);
        assert!(config.normalize);
        assert_eq!(config.model_version, DEFAULT_MODEL_VERSION);
    }
}
