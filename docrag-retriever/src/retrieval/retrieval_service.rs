//! Online query path: embed the query, search the live generation.
//!
//! ## Input clamping
//!
//! - `limit`: missing → `default_limit`; otherwise clamped to `[min_limit, max_limit]`.
//! - `content_length`: snapped to the nearest configured granularity. A value exactly
//!   between two granularities goes to the smaller one; values above the largest go
//!   to the largest. Missing → the largest granularity. Zero or negative → no filter,
//!   or the smallest granularity when `non_positive_filter = "smallest"`.
//!
//! With granularities `{500, 1000}`: 700 → 500, 750 → 500, 751 → 1000, 5000 → 1000.

use crate::config::{NonPositiveFilter, RetrievalConfig};
use crate::error::{Error, Result, Upstream};
use crate::storage::{SearchHit, VectorStore};
use docrag_context::normalize_text;
use docrag_embed::EmbeddingProvider;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One retrieval request as received from callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalQuery {
    pub text: String,
    #[serde(default)]
    pub content_length: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
    /// Set to false to return only title, url and distance
    #[serde(default = "default_include_content")]
    pub include_content: bool,
}

fn default_include_content() -> bool {
    true
}

impl RetrievalQuery {
    pub fn new<S: Into<String>>(text: S) -> Self {
        Self {
            text: text.into(),
            content_length: None,
            limit: None,
            include_content: true,
        }
    }

    pub fn with_content_length(self, content_length: i64) -> Self {
        Self {
            content_length: Some(content_length),
            ..self
        }
    }

    pub fn with_limit(self, limit: i64) -> Self {
        Self {
            limit: Some(limit),
            ..self
        }
    }

    pub fn without_content(self) -> Self {
        Self {
            include_content: false,
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedDocument {
    pub title: Option<String>,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub content_length: usize,
    pub distance: f32,
}

impl RetrievedDocument {
    fn from_hit(hit: SearchHit, include_content: bool) -> Self {
        Self {
            title: hit.title,
            url: hit.url,
            content: include_content.then_some(hit.content),
            content_length: hit.content_length,
            distance: hit.distance,
        }
    }
}

pub struct RetrievalService {
    store: Arc<dyn VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    granularities: Vec<usize>,
    config: RetrievalConfig,
}

impl RetrievalService {
    /// `granularities` must be non-empty; they are kept sorted ascending. The limit
    /// bounds in `config` are checked here so clamping never sees an empty range.
    pub fn new(
        store: Arc<dyn VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        granularities: &[usize],
        config: RetrievalConfig,
    ) -> Result<Self> {
        config.validate()?;
        let mut granularities = granularities.to_vec();
        granularities.sort_unstable();
        granularities.dedup();
        if granularities.is_empty() || granularities[0] == 0 {
            return Err(Error::invalid_config(
                "retrieval needs at least one positive granularity",
            ));
        }
        Ok(Self {
            store,
            provider,
            granularities,
            config,
        })
    }

    pub fn clamp_limit(&self, limit: Option<i64>) -> usize {
        match limit {
            None => self.config.default_limit,
            Some(limit) => {
                limit.clamp(self.config.min_limit as i64, self.config.max_limit as i64) as usize
            }
        }
    }

    /// Maps a requested `content_length` to the granularity to filter on, or
    /// `None` for an unfiltered search.
    pub fn snap_content_length(&self, requested: Option<i64>) -> Option<usize> {
        if !self.config.filter_by_granularity {
            return None;
        }
        let smallest = self.granularities[0];
        let largest = self.granularities[self.granularities.len() - 1];
        match requested {
            None => Some(largest),
            Some(value) if value <= 0 => match self.config.non_positive_filter {
                NonPositiveFilter::Unfiltered => None,
                NonPositiveFilter::Smallest => Some(smallest),
            },
            Some(value) => {
                let value = value as u64;
                let mut best = smallest;
                for &g in &self.granularities {
                    // Strict comparison keeps the smaller granularity on ties.
                    if value.abs_diff(g as u64) < value.abs_diff(best as u64) {
                        best = g;
                    }
                }
                Some(best)
            }
        }
    }

    /// Nearest documents to `query.text`, nearest first.
    pub async fn retrieve(&self, query: &RetrievalQuery) -> Result<Vec<RetrievedDocument>> {
        if query.text.trim().is_empty() {
            return Err(Error::invalid_input("query text must not be empty"));
        }
        let limit = self.clamp_limit(query.limit);
        let content_length = self.snap_content_length(query.content_length);

        let live = self.store.live_metadata().await?;
        if live.model != self.provider.model_name()
            || live.dimension != self.provider.embedding_dimension()
        {
            return Err(Error::consistency(format!(
                "live generation was built with {} ({} dimensions), queries use {} ({} dimensions)",
                live.model,
                live.dimension,
                self.provider.model_name(),
                self.provider.embedding_dimension()
            )));
        }

        let embedding = self
            .provider
            .embed_text(&normalize_text(&query.text))
            .await
            .map_err(|e| {
                tracing::warn!("Query embedding failed: {}", e);
                Error::upstream(Upstream::Embedding, e)
            })?;

        let hits = self
            .store
            .search_live(&embedding, content_length, limit)
            .await?;
        tracing::debug!(
            "Retrieved {} documents (limit {}, content_length {:?})",
            hits.len(),
            limit,
            content_length
        );
        Ok(hits
            .into_iter()
            .map(|hit| RetrievedDocument::from_hit(hit, query.include_content))
            .collect())
    }
}
