//! Drives chunks through the embedding provider in bounded buckets.

use crate::error::{Error, Result};
use docrag_context::Chunk;
use docrag_embed::EmbeddingProvider;
use std::sync::Arc;

pub struct EmbeddingBatcher {
    provider: Arc<dyn EmbeddingProvider>,
    bucket_size: usize,
}

impl EmbeddingBatcher {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, bucket_size: usize) -> Self {
        Self {
            provider,
            bucket_size: bucket_size.max(1),
        }
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// Fills in the embedding of every chunk, in order.
    ///
    /// Buckets of at most `bucket_size` texts are sent one after another. Chunks are
    /// only modified once every bucket has succeeded; on failure the error carries
    /// how many texts were embedded before it.
    pub async fn embed(&self, chunks: &mut [Chunk]) -> Result<()> {
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let total = texts.len();
        let buckets = total.div_ceil(self.bucket_size);
        tracing::info!(
            "Embedding {} chunks in {} buckets of up to {}",
            total,
            buckets,
            self.bucket_size
        );

        let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(total);
        for (i, bucket) in texts.chunks(self.bucket_size).enumerate() {
            let result = match self.provider.embed_texts(bucket).await {
                Ok(result) => result,
                Err(e) => return Err(Error::interrupted(embeddings.len(), total, e.into())),
            };
            if result.len() != bucket.len() {
                let mismatch = Error::consistency(format!(
                    "bucket {i} asked for {} embeddings, provider returned {}",
                    bucket.len(),
                    result.len()
                ));
                return Err(Error::interrupted(embeddings.len(), total, mismatch));
            }
            embeddings.extend(result.embeddings);
            tracing::debug!("Embedded bucket {}/{} ({} texts)", i + 1, buckets, bucket.len());
        }

        for (chunk, embedding) in chunks.iter_mut().zip(embeddings) {
            chunk.embedding = Some(embedding);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use docrag_embed::{EmbedError, EmbeddingResult};
    use std::sync::Mutex;

    /// Embeds each text as `[len, bucket index]`; the bucket numbered `short_bucket`
    /// comes back one vector short.
    struct ScriptedProvider {
        calls: Mutex<Vec<usize>>,
        short_bucket: Option<usize>,
    }

    impl ScriptedProvider {
        fn new(short_bucket: Option<usize>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                short_bucket,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        async fn embed_texts(&self, texts: &[String]) -> docrag_embed::Result<EmbeddingResult> {
            let bucket = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(texts.len());
                calls.len() - 1
            };
            let mut out: Vec<Vec<f32>> = texts
                .iter()
                .map(|t| vec![t.len() as f32, bucket as f32])
                .collect();
            if self.short_bucket == Some(bucket) {
                out.pop();
            }
            Ok(EmbeddingResult::new(out))
        }

        fn embedding_dimension(&self) -> usize {
            2
        }

        fn provider_name(&self) -> &str {
            "scripted"
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl EmbeddingProvider for FailingProvider {
        async fn embed_texts(&self, _texts: &[String]) -> docrag_embed::Result<EmbeddingResult> {
            Err(EmbedError::provider(503, "overloaded"))
        }

        fn embedding_dimension(&self) -> usize {
            2
        }

        fn provider_name(&self) -> &str {
            "failing"
        }

        fn model_name(&self) -> &str {
            "failing"
        }
    }

    fn chunks(n: usize) -> Vec<Chunk> {
        (0..n)
            .map(|i| Chunk {
                title: None,
                url: "https://docs".to_string(),
                content: "x".repeat(i + 1),
                content_length: 500,
                embedding: None,
            })
            .collect()
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_embed_preserves_order_across_buckets() {
        let provider = Arc::new(ScriptedProvider::new(None));
        let batcher = EmbeddingBatcher::new(provider.clone(), 3);
        let mut batch = chunks(7);

        batcher.embed(&mut batch).await.unwrap();

        assert_eq!(*provider.calls.lock().unwrap(), vec![3, 3, 1]);
        for (i, chunk) in batch.iter().enumerate() {
            let embedding = chunk.embedding.as_ref().unwrap();
            assert_eq!(embedding[0], (i + 1) as f32);
            assert_eq!(embedding[1], (i / 3) as f32);
        }
        assert!(logs_contain("Embedding 7 chunks in 3 buckets of up to 3"));
    }

    #[tokio::test]
    async fn test_short_bucket_fails_whole_call() {
        let batcher = EmbeddingBatcher::new(Arc::new(ScriptedProvider::new(Some(1))), 2);
        let mut batch = chunks(5);

        let err = batcher.embed(&mut batch).await.unwrap_err();

        assert_eq!(err.progress(), Some((2, 5)));
        assert_eq!(err.kind(), crate::error::ErrorKind::ConsistencyViolation);
        assert!(batch.iter().all(|c| c.embedding.is_none()));
    }

    #[tokio::test]
    async fn test_provider_failure_is_upstream() {
        let batcher = EmbeddingBatcher::new(Arc::new(FailingProvider), 10);
        let mut batch = chunks(3);

        let err = batcher.embed(&mut batch).await.unwrap_err();

        assert_eq!(err.progress(), Some((0, 3)));
        assert_eq!(err.kind(), crate::error::ErrorKind::UpstreamUnavailable);
        assert!(batch.iter().all(|c| c.embedding.is_none()));
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_calls() {
        let provider = Arc::new(ScriptedProvider::new(None));
        let batcher = EmbeddingBatcher::new(provider.clone(), 4);
        batcher.embed(&mut []).await.unwrap();
        assert!(provider.calls.lock().unwrap().is_empty());
    }
}
