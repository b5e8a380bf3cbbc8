//! # docrag-embed
//!
//! Remote inference client for docrag. Embeddings are produced by a sentence
//! embedding model hosted on Replicate and consumed through the [`EmbeddingProvider`]
//! trait, so the indexing pipeline and the retrieval service share one embedding
//! space and tests can swap in an in-process provider.
//!
//! ## Quick Start
//!
//! ```no_run
//! use docrag_embed::{EmbedConfig, EmbeddingProvider, ReplicateEmbeddingProvider};
//!
//! # async fn example() -> docrag_embed::Result<()> {
//! let provider = ReplicateEmbeddingProvider::create(
//!     EmbedConfig::default().with_token_from_env(),
//! )?;
//!
//! let texts = vec!["Hello world".to_string(), "How are you?".to_string()];
//! let result = provider.embed_texts(&texts).await?;
//!
//! println!("Generated {} embeddings of dimension {}",
//!          result.len(), result.dimension);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: provider configuration with defaults for bge-large-en-v1.5
//! - [`replicate`]: predictions API client shared with the LLM side of RAG
//! - [`provider`]: the [`EmbeddingProvider`] trait and the Replicate implementation
//! - [`error`]: error types and result handling

pub mod config;
pub mod error;
pub mod provider;
pub mod replicate;

// Re-export main types for easy access
pub use config::EmbedConfig;
pub use error::{EmbedError, Result};
pub use provider::{EmbeddingProvider, EmbeddingResult, ReplicateEmbeddingProvider};
pub use replicate::{Prediction, PredictionRequest, PredictionStatus, ReplicateClient};
