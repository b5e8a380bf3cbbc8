//! Wiring of store, provider, pipeline and retrieval service from one config.

use crate::config::DocragConfig;
use crate::error::Result;
use crate::retrieval::indexing_pipeline::IndexingPipeline;
use crate::retrieval::retrieval_service::RetrievalService;
use crate::retrieval::scraper::{DocumentSource, HttpScraper};
use crate::storage::{VectorStore, open_store};
use docrag_embed::{EmbeddingProvider, ReplicateEmbeddingProvider};
use std::sync::Arc;

/// Shared handles used by the CLI and the HTTP server.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<DocragConfig>,
    pub store: Arc<dyn VectorStore>,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub pipeline: Arc<IndexingPipeline>,
    pub retrieval: Arc<RetrievalService>,
}

impl Services {
    /// Opens the configured store and Replicate provider.
    pub async fn from_config(config: DocragConfig) -> Result<Self> {
        config.validate()?;
        let store = open_store(&config.database, &config.indexing).await?;
        let provider: Arc<dyn EmbeddingProvider> =
            Arc::new(ReplicateEmbeddingProvider::create(config.embedding.clone())?);
        let source = Arc::new(HttpScraper::new(config.embedding.request_timeout())?);
        Self::with_components(config, source, provider, store)
    }

    /// Builds services around caller-supplied components after validating `config`.
    pub fn with_components(
        config: DocragConfig,
        source: Arc<dyn DocumentSource>,
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
    ) -> Result<Self> {
        config.validate()?;
        let pipeline = IndexingPipeline::new(
            source,
            Arc::clone(&provider),
            Arc::clone(&store),
            config.indexing.clone(),
        );
        let retrieval = RetrievalService::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            &config.indexing.granularities,
            config.retrieval.clone(),
        )?;
        Ok(Self {
            config: Arc::new(config),
            store,
            provider,
            pipeline: Arc::new(pipeline),
            retrieval: Arc::new(retrieval),
        })
    }
}
