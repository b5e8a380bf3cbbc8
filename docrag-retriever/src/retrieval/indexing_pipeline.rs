//! Full index builds: scrape, chunk, embed, populate, index, deploy.
//!
//! Granularities are chunked and embedded concurrently (each has its own chunk set)
//! and meet again at `populate`. Every stage must succeed before `deploy`; a failed
//! build leaves the live generation untouched and its staging generation is
//! replaced by the next `prepare`.

use crate::config::IndexingConfig;
use crate::error::{BuildError, BuildStage, Error, Result};
use crate::retrieval::embedding_batcher::EmbeddingBatcher;
use crate::retrieval::scraper::{DocumentSource, fetch_all};
use crate::storage::{
    GenerationSpec, IndexReport, Promotion, VectorStore, VectorStoreManager,
};
use docrag_context::{Chunk, Document, WindowChunker};
use docrag_embed::EmbeddingProvider;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Optional overrides for one build; unset fields use the configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildRequest {
    pub urls: Option<Vec<String>>,
    pub granularities: Option<Vec<usize>>,
    pub bucket_size: Option<usize>,
    pub allow_bootstrap: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub documents: usize,
    pub chunks_by_granularity: BTreeMap<usize, usize>,
    pub rows: u64,
    pub lists: usize,
    pub effective_lists: usize,
    pub promotion: Promotion,
    pub elapsed_ms: u128,
}

/// Resolved parameters for one build.
#[derive(Debug, Clone, PartialEq)]
struct BuildPlan {
    urls: Vec<String>,
    granularities: Vec<NonZeroUsize>,
    bucket_size: usize,
    allow_bootstrap: bool,
}

pub struct IndexingPipeline {
    source: Arc<dyn DocumentSource>,
    provider: Arc<dyn EmbeddingProvider>,
    manager: VectorStoreManager,
    config: IndexingConfig,
    build_lock: Mutex<()>,
}

impl IndexingPipeline {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        config: IndexingConfig,
    ) -> Self {
        let spec = GenerationSpec {
            model: provider.model_name().to_string(),
            dimension: provider.embedding_dimension(),
        };
        let manager = VectorStoreManager::new(store, spec, config.insert_batch_size);
        Self {
            source,
            provider,
            manager,
            config,
            build_lock: Mutex::new(()),
        }
    }

    pub fn manager(&self) -> &VectorStoreManager {
        &self.manager
    }

    /// True while a build holds the pipeline.
    pub fn is_building(&self) -> bool {
        self.build_lock.try_lock().is_err()
    }

    fn plan(&self, request: BuildRequest) -> Result<BuildPlan> {
        let urls = request.urls.unwrap_or_else(|| self.config.urls.clone());
        if urls.is_empty() {
            return Err(Error::invalid_input("at least one URL is required"));
        }

        let requested = request
            .granularities
            .unwrap_or_else(|| self.config.granularities.clone());
        if requested.is_empty() {
            return Err(Error::invalid_input("at least one granularity is required"));
        }
        let mut granularities = Vec::with_capacity(requested.len());
        for g in requested {
            // Retrieval only snaps to configured granularities; other rows are unreachable.
            if !self.config.granularities.contains(&g) {
                return Err(Error::invalid_input(format!(
                    "granularity {g} is not one of the configured granularities {:?}",
                    self.config.granularities
                )));
            }
            let g = NonZeroUsize::new(g)
                .ok_or_else(|| Error::invalid_input("granularities must be positive"))?;
            if !granularities.contains(&g) {
                granularities.push(g);
            }
        }

        let bucket_size = request.bucket_size.unwrap_or(self.config.bucket_size);
        if bucket_size == 0 {
            return Err(Error::invalid_input("bucket_size must be positive"));
        }

        Ok(BuildPlan {
            urls,
            granularities,
            bucket_size,
            allow_bootstrap: request
                .allow_bootstrap
                .unwrap_or(self.config.allow_bootstrap),
        })
    }

    /// Runs one complete build. Concurrent calls wait for the running build.
    pub async fn run(&self, request: BuildRequest) -> std::result::Result<BuildReport, BuildError> {
        let _guard = self.build_lock.lock().await;
        let started = Instant::now();

        let plan = self.plan(request).map_err(failed_at(BuildStage::Prepare))?;
        tracing::info!(
            "Starting build: {} URLs, granularities {:?}, bucket size {}",
            plan.urls.len(),
            plan.granularities,
            plan.bucket_size
        );

        self.manager
            .prepare()
            .await
            .map_err(failed_at(BuildStage::Prepare))?;

        let documents = fetch_all(
            self.source.as_ref(),
            &plan.urls,
            self.config.scrape_concurrency,
        )
        .await
        .map_err(failed_at(BuildStage::Scrape))?;
        tracing::info!("Scraped {} documents", documents.len());

        let batcher = EmbeddingBatcher::new(Arc::clone(&self.provider), plan.bucket_size);
        let chunk_sets = try_join_all(
            plan.granularities
                .iter()
                .map(|g| chunk_and_embed(&documents, *g, &batcher)),
        )
        .await
        .map_err(failed_at(BuildStage::Embed))?;

        let chunks_by_granularity: BTreeMap<usize, usize> = plan
            .granularities
            .iter()
            .zip(&chunk_sets)
            .map(|(g, chunks)| (g.get(), chunks.len()))
            .collect();
        let all_chunks: Vec<Chunk> = chunk_sets.into_iter().flatten().collect();

        let rows = self
            .manager
            .populate(&all_chunks)
            .await
            .map_err(failed_at(BuildStage::Populate))?;

        let IndexReport {
            lists,
            effective_lists,
            ..
        } = self
            .manager
            .build_index(rows)
            .await
            .map_err(failed_at(BuildStage::Index))?;

        let promotion = self
            .manager
            .deploy(plan.allow_bootstrap)
            .await
            .map_err(failed_at(BuildStage::Deploy))?;

        let report = BuildReport {
            documents: documents.len(),
            chunks_by_granularity,
            rows,
            lists,
            effective_lists,
            promotion,
            elapsed_ms: started.elapsed().as_millis(),
        };
        tracing::info!(
            "Build finished: {} documents, {} rows, {} lists in {} ms",
            report.documents,
            report.rows,
            report.effective_lists,
            report.elapsed_ms
        );
        Ok(report)
    }
}

async fn chunk_and_embed(
    documents: &[Document],
    granularity: NonZeroUsize,
    batcher: &EmbeddingBatcher,
) -> Result<Vec<Chunk>> {
    let chunker = WindowChunker::new(granularity);
    let mut chunks: Vec<Chunk> = documents
        .iter()
        .flat_map(|doc| chunker.get_chunks(doc))
        .collect();
    tracing::info!("Chunked {} chunks at granularity {}", chunks.len(), granularity);
    batcher.embed(&mut chunks).await?;
    Ok(chunks)
}

fn failed_at(stage: BuildStage) -> impl FnOnce(Error) -> BuildError {
    move |source| {
        let err = BuildError::new(stage, source);
        tracing::error!("{}", err);
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, Upstream};
    use crate::storage::{GenerationInfo, SearchHit, StoreStatus, TableNames};
    use crate::storage::sqlite_store::{IvfParams, SqliteVectorStore};
    use async_trait::async_trait;
    use docrag_embed::{EmbedError, EmbeddingResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    struct StaticPages;

    #[async_trait]
    impl DocumentSource for StaticPages {
        async fn fetch(&self, url: &str) -> Result<Document> {
            let length = url.rsplit('/').next().and_then(|n| n.parse().ok()).unwrap_or(0);
            Ok(Document::new(url, None, "a".repeat(length)))
        }
    }

    /// Two-dimensional embeddings; fails every call after `fail_after` calls.
    struct CountingProvider {
        calls: AtomicUsize,
        fail_after: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        async fn embed_texts(&self, texts: &[String]) -> docrag_embed::Result<EmbeddingResult> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.fail_after {
                return Err(EmbedError::provider(500, "boom"));
            }
            Ok(EmbeddingResult::new(
                texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect(),
            ))
        }

        fn embedding_dimension(&self) -> usize {
            2
        }

        fn provider_name(&self) -> &str {
            "counting"
        }

        fn model_name(&self) -> &str {
            "counting"
        }
    }

    async fn pipeline(fail_after: usize) -> IndexingPipeline {
        let store = SqliteVectorStore::open_memory(
            TableNames::from_base("embeddings").unwrap(),
            IvfParams::default(),
        )
        .await
        .unwrap();
        let config = IndexingConfig {
            urls: vec!["https://docs/250".to_string(), "https://docs/1500".to_string()],
            granularities: vec![500, 1000],
            bucket_size: 2,
            ..Default::default()
        };
        IndexingPipeline::new(
            Arc::new(StaticPages),
            Arc::new(CountingProvider {
                calls: AtomicUsize::new(0),
                fail_after,
            }),
            Arc::new(store),
            config,
        )
    }

    #[tokio::test]
    async fn test_build_with_two_granularities() {
        let pipeline = pipeline(usize::MAX).await;
        let report = pipeline.run(BuildRequest::default()).await.unwrap();

        assert_eq!(report.documents, 2);
        // 250 -> 1 chunk at both sizes; 1500 -> 3 at 500, 2 at 1000
        assert_eq!(report.chunks_by_granularity.get(&500), Some(&4));
        assert_eq!(report.chunks_by_granularity.get(&1000), Some(&3));
        assert_eq!(report.rows, 7);
        assert_eq!(report.lists, 10);
        assert_eq!(report.promotion, Promotion::Bootstrapped);

        let status = pipeline.manager().store().status().await.unwrap();
        assert_eq!(status.live.unwrap().row_count, 7);
        assert!(!pipeline.is_building());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_embed_failure_aborts_before_deploy() {
        let pipeline = pipeline(1).await;
        let err = pipeline.run(BuildRequest::default()).await.unwrap_err();

        assert_eq!(err.stage, BuildStage::Embed);
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
        assert!(err.completed.is_some());
        assert!(!pipeline.manager().store().live_exists().await.unwrap());
        assert!(logs_contain("build failed during embed"));
    }

    #[tokio::test]
    async fn test_rejects_invalid_overrides() {
        let pipeline = pipeline(usize::MAX).await;
        let request = BuildRequest {
            granularities: Some(vec![0]),
            ..Default::default()
        };
        let err = pipeline.run(request).await.unwrap_err();
        assert_eq!(err.stage, BuildStage::Prepare);
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_unconfigured_granularity_keeps_live_generation() {
        let pipeline = pipeline(usize::MAX).await;
        pipeline.run(BuildRequest::default()).await.unwrap();
        let before = pipeline.manager().store().live_metadata().await.unwrap();

        let request = BuildRequest {
            granularities: Some(vec![500, 300]),
            ..Default::default()
        };
        let err = pipeline.run(request).await.unwrap_err();
        assert_eq!(err.stage, BuildStage::Prepare);
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(err.to_string().contains("granularity 300"));

        let status = pipeline.manager().store().status().await.unwrap();
        assert_eq!(status.live.unwrap().generation, before.generation);
        assert_eq!(
            status.rows_by_granularity.keys().copied().collect::<Vec<_>>(),
            vec![500, 1000]
        );

        // A configured subset is still a valid override
        let request = BuildRequest {
            granularities: Some(vec![1000]),
            ..Default::default()
        };
        let report = pipeline.run(request).await.unwrap();
        assert_eq!(report.rows, 3);
    }

    /// Delegates to SQLite; the `fail_at`-th insert after arming fails.
    struct FlakyInserts {
        inner: SqliteVectorStore,
        inserts: AtomicUsize,
        fail_at: AtomicUsize,
    }

    impl FlakyInserts {
        fn arm(&self, fail_at: usize) {
            self.inserts.store(0, Ordering::SeqCst);
            self.fail_at.store(fail_at, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl VectorStore for FlakyInserts {
        fn backend_name(&self) -> &str {
            self.inner.backend_name()
        }

        async fn prepare_staging(&self, spec: &GenerationSpec) -> Result<()> {
            self.inner.prepare_staging(spec).await
        }

        async fn insert_staging(&self, chunks: &[Chunk]) -> Result<u64> {
            let call = self.inserts.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.fail_at.load(Ordering::SeqCst) {
                return Err(Error::upstream(
                    Upstream::Database,
                    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection reset"),
                ));
            }
            self.inner.insert_staging(chunks).await
        }

        async fn staging_row_count(&self) -> Result<u64> {
            self.inner.staging_row_count().await
        }

        async fn build_staging_index(&self, lists: usize) -> Result<usize> {
            self.inner.build_staging_index(lists).await
        }

        async fn promote_staging(&self) -> Result<Promotion> {
            self.inner.promote_staging().await
        }

        async fn live_exists(&self) -> Result<bool> {
            self.inner.live_exists().await
        }

        async fn live_metadata(&self) -> Result<GenerationInfo> {
            self.inner.live_metadata().await
        }

        async fn search_live(
            &self,
            query: &[f32],
            content_length: Option<usize>,
            limit: usize,
        ) -> Result<Vec<SearchHit>> {
            self.inner.search_live(query, content_length, limit).await
        }

        async fn status(&self) -> Result<StoreStatus> {
            self.inner.status().await
        }
    }

    #[tokio::test]
    async fn test_populate_failure_reports_progress_and_keeps_live() {
        let store = Arc::new(FlakyInserts {
            inner: SqliteVectorStore::open_memory(
                TableNames::from_base("embeddings").unwrap(),
                IvfParams::default(),
            )
            .await
            .unwrap(),
            inserts: AtomicUsize::new(0),
            fail_at: AtomicUsize::new(usize::MAX),
        });
        let config = IndexingConfig {
            urls: vec!["https://docs/250".to_string(), "https://docs/1500".to_string()],
            granularities: vec![500, 1000],
            insert_batch_size: 2,
            ..Default::default()
        };
        let pipeline = IndexingPipeline::new(
            Arc::new(StaticPages),
            Arc::new(CountingProvider {
                calls: AtomicUsize::new(0),
                fail_after: usize::MAX,
            }),
            store.clone(),
            config,
        );
        pipeline.run(BuildRequest::default()).await.unwrap();
        let before = store.live_metadata().await.unwrap();

        store.arm(2);
        let request = BuildRequest {
            urls: Some(vec!["https://docs/3000".to_string()]),
            ..Default::default()
        };
        let err = pipeline.run(request).await.unwrap_err();
        assert_eq!(err.stage, BuildStage::Populate);
        assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
        // 3000 chars -> 6 chunks at 500 and 3 at 1000; the second batch of 2 fails
        assert_eq!(err.completed, Some(2));
        assert_eq!(err.total, Some(9));
        assert!(err.to_string().contains("(2 of 9 items succeeded)"));

        let after = store.live_metadata().await.unwrap();
        assert_eq!(after.generation, before.generation);
        assert_eq!(after.row_count, 7);
        assert!(!pipeline.is_building());
    }

    #[tokio::test]
    async fn test_bootstrap_can_be_refused_per_request() {
        let pipeline = pipeline(usize::MAX).await;
        let request = BuildRequest {
            allow_bootstrap: Some(false),
            ..Default::default()
        };
        let err = pipeline.run(request).await.unwrap_err();
        assert_eq!(err.stage, BuildStage::Deploy);

        let report = pipeline.run(BuildRequest::default()).await.unwrap();
        assert_eq!(report.promotion, Promotion::Bootstrapped);
        let request = BuildRequest {
            allow_bootstrap: Some(false),
            urls: Some(vec!["https://docs/100".to_string()]),
            ..Default::default()
        };
        let report = pipeline.run(request).await.unwrap();
        assert_eq!(report.promotion, Promotion::Replaced);
        assert_eq!(report.rows, 2);
    }
}
