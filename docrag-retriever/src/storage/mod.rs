//! Storage layer for table generations.
//!
//! A [`VectorStore`] holds up to three generations of embedding rows under names
//! derived from one base name (see [`TableNames`]): *live* answers queries,
//! *staging* is being built, *retired* only exists for the instant a deploy
//! replaces the previous live generation. The build lifecycle on top of these
//! primitives lives in [`manager::VectorStoreManager`].
//!
//! ## Backends
//!
//! - [`sqlite_store::SqliteVectorStore`]: default; IVF index built in-process
//! - `postgres_store::PgVectorStore`: pgvector `ivfflat`, behind the `postgres` feature

use crate::config::{DatabaseConfig, IndexingConfig, validate_identifier};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docrag_context::Chunk;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod ivf;
pub mod manager;
#[cfg(feature = "postgres")]
pub mod postgres_store;
pub mod sqlite_store;

pub use manager::{BuildState, IndexReport, VectorStoreManager, lists_for_rows};

/// Names of the live, staging and retired generations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub live: String,
    pub staging: String,
    pub retired: String,
}

impl TableNames {
    /// Derives `<base>`, `<base>_new` and `<base>_old`, rejecting names that are
    /// not plain SQL identifiers.
    pub fn from_base(base: &str) -> Result<Self> {
        validate_identifier(base)?;
        Ok(Self {
            live: base.to_string(),
            staging: format!("{base}_new"),
            retired: format!("{base}_old"),
        })
    }
}

/// What a new generation is built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationSpec {
    pub model: String,
    pub dimension: usize,
}

/// Metadata recorded with a deployed generation.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationInfo {
    pub generation: String,
    pub model: String,
    pub dimension: usize,
    pub lists: usize,
    pub effective_lists: usize,
    pub row_count: u64,
    pub built_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub backend: String,
    pub live: Option<GenerationInfo>,
    pub staging_present: bool,
    pub rows_by_granularity: BTreeMap<usize, u64>,
}

/// One nearest-neighbor result from the live generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: i64,
    pub title: Option<String>,
    pub url: String,
    pub content: String,
    pub content_length: usize,
    pub distance: f32,
}

/// How a deploy changed the live generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Promotion {
    /// No live generation existed before
    Bootstrapped,
    /// A previous live generation was retired and dropped
    Replaced,
}

/// Generation storage primitives. Implementations must make
/// [`promote_staging`](VectorStore::promote_staging) atomic for readers.
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn backend_name(&self) -> &str;

    /// Drops any staging generation and creates an empty one for `spec`.
    async fn prepare_staging(&self, spec: &GenerationSpec) -> Result<()>;

    /// Inserts chunks into staging; every chunk must carry an embedding of the
    /// staging dimension. Returns the number of rows written.
    async fn insert_staging(&self, chunks: &[Chunk]) -> Result<u64>;

    async fn staging_row_count(&self) -> Result<u64>;

    /// Builds the ANN index on staging and returns the list count actually used.
    async fn build_staging_index(&self, lists: usize) -> Result<usize>;

    /// Makes staging the live generation and drops the previous one.
    async fn promote_staging(&self) -> Result<Promotion>;

    async fn live_exists(&self) -> Result<bool>;

    /// Fails with [`Error::NotReady`] when nothing has been deployed.
    async fn live_metadata(&self) -> Result<GenerationInfo>;

    /// Nearest rows to `query` by cosine distance, optionally restricted to one
    /// granularity.
    async fn search_live(
        &self,
        query: &[f32],
        content_length: Option<usize>,
        limit: usize,
    ) -> Result<Vec<SearchHit>>;

    async fn status(&self) -> Result<StoreStatus>;
}

/// Opens the backend selected by the database URL.
pub async fn open_store(
    database: &DatabaseConfig,
    indexing: &IndexingConfig,
) -> Result<Arc<dyn VectorStore>> {
    let tables = TableNames::from_base(&database.table)?;
    tracing::info!("Opening vector store at {}", database.redacted_url());

    if database.url.starts_with("postgres://") || database.url.starts_with("postgresql://") {
        #[cfg(feature = "postgres")]
        {
            let store = postgres_store::PgVectorStore::connect(
                &database.url,
                database.max_connections,
                tables,
                indexing.probes,
            )
            .await?;
            return Ok(Arc::new(store));
        }
        #[cfg(not(feature = "postgres"))]
        return Err(Error::invalid_config(
            "postgres URL given but docrag-retriever was built without the `postgres` feature",
        ));
    }

    let params = sqlite_store::IvfParams {
        kmeans_iterations: indexing.kmeans_iterations,
        probes: indexing.probes,
    };
    let store = sqlite_store::SqliteVectorStore::connect(
        &database.url,
        database.max_connections,
        tables,
        params,
    )
    .await?;
    Ok(Arc::new(store))
}

/// Checks that every chunk has an embedding of `dimension` values.
pub(crate) fn check_chunks(chunks: &[Chunk], dimension: usize) -> Result<()> {
    let missing = chunks.iter().filter(|c| c.embedding.is_none()).count();
    if missing > 0 {
        return Err(Error::MissingEmbedding {
            missing,
            total: chunks.len(),
        });
    }
    if let Some(bad) = chunks
        .iter()
        .filter_map(|c| c.embedding.as_ref())
        .find(|e| e.len() != dimension)
    {
        return Err(Error::consistency(format!(
            "embedding has {} dimensions, staging expects {dimension}",
            bad.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names() {
        let names = TableNames::from_base("embeddings").unwrap();
        assert_eq!(names.live, "embeddings");
        assert_eq!(names.staging, "embeddings_new");
        assert_eq!(names.retired, "embeddings_old");
        assert!(TableNames::from_base("bad name").is_err());
    }

    #[test]
    fn test_check_chunks() {
        let mut chunk = Chunk {
            title: None,
            url: "https://x".to_string(),
            content: "hello".to_string(),
            content_length: 500,
            embedding: None,
        };
        assert!(matches!(
            check_chunks(std::slice::from_ref(&chunk), 2),
            Err(Error::MissingEmbedding {
                missing: 1,
                total: 1
            })
        ));
        chunk.embedding = Some(vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            check_chunks(std::slice::from_ref(&chunk), 2),
            Err(Error::Consistency { .. })
        ));
        assert!(check_chunks(&[chunk], 3).is_ok());
    }
}
