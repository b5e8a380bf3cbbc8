//! Embedding provider implementations

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use crate::replicate::{PredictionRequest, ReplicateClient};
use async_trait::async_trait;
use serde_json::json;

/// Result of embedding generation
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text, in input order
    pub embeddings: Vec<Vec<f32>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
}

impl EmbeddingResult {
    /// Create a new embedding result.
    ///
    /// The dimension is inferred from the first embedding vector and defaults to 0
    /// for an empty result.
    pub fn new(embeddings: Vec<Vec<f32>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    /// Returns the number of embedding vectors in this result.
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    /// Returns `true` if this result contains no embedding vectors.
    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Trait for embedding providers that can generate embeddings from text
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for multiple texts in one provider call.
    ///
    /// Implementations must return exactly one vector per input, in input order,
    /// or fail with [`EmbedError::ResponseMismatch`].
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    /// Generate the embedding for a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let result = self.embed_texts(&[text.to_string()]).await?;
        let actual = result.len();
        match result.embeddings.into_iter().next() {
            Some(embedding) if actual == 1 => Ok(embedding),
            _ => Err(EmbedError::ResponseMismatch {
                expected: 1,
                actual,
            }),
        }
    }

    /// Get the dimension of embeddings produced by this provider
    fn embedding_dimension(&self) -> usize;

    /// Get the name/identifier of this provider
    fn provider_name(&self) -> &str;

    /// Identifier of the model behind this provider; index and query embeddings
    /// are only comparable when this matches
    fn model_name(&self) -> &str;
}

/// Embedding provider backed by a Replicate-hosted sentence embedding model.
///
/// Texts are sent as a JSON-encoded array in the `texts` input, the format used by
/// the bge family of models on Replicate. Text normalization is left to the caller
/// and L2 normalization is only requested when [`EmbedConfig::normalize`] is set.
#[derive(Debug, Clone)]
pub struct ReplicateEmbeddingProvider {
    client: ReplicateClient,
    config: EmbedConfig,
}

impl ReplicateEmbeddingProvider {
    /// Creates a provider, validating the configuration first.
    pub fn create(config: EmbedConfig) -> Result<Self> {
        let client = ReplicateClient::from_config(&config)?;
        tracing::info!(
            "Using Replicate embedding model {} ({} dimensions)",
            config.model_name,
            config.dimension
        );
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &EmbedConfig {
        &self.config
    }

    fn prediction_for(&self, texts: &[String]) -> Result<PredictionRequest> {
        let input = json!({
            "texts": serde_json::to_string(texts)?,
            "batch_size": self.config.provider_batch_size,
            "convert_to_numpy": false,
            "normalize_embeddings": self.config.normalize,
        });
        Ok(PredictionRequest::new(&self.config.model_version, input))
    }
}

/// Checks a decoded provider output against the request it answers.
pub fn check_embeddings(
    embeddings: &[Vec<f32>],
    expected_count: usize,
    expected_dimension: usize,
) -> Result<()> {
    if embeddings.len() != expected_count {
        return Err(EmbedError::ResponseMismatch {
            expected: expected_count,
            actual: embeddings.len(),
        });
    }
    if let Some(bad) = embeddings.iter().find(|e| e.len() != expected_dimension) {
        return Err(EmbedError::DimensionMismatch {
            expected: expected_dimension,
            actual: bad.len(),
        });
    }
    Ok(())
}

#[async_trait]
impl EmbeddingProvider for ReplicateEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(Vec::new()));
        }

        let request = self.prediction_for(texts)?;
        let output = self.client.run(&request).await?;
        let embeddings: Vec<Vec<f32>> = serde_json::from_value(output)?;
        check_embeddings(&embeddings, texts.len(), self.config.dimension)?;

        tracing::debug!(
            "Embedded {} texts with {}",
            embeddings.len(),
            self.config.model_name
        );
        Ok(EmbeddingResult::new(embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.config.dimension
    }

    fn provider_name(&self) -> &str {
        "replicate"
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }
}
