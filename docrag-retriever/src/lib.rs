//! docrag-retriever: index builder and retriever for documentation RAG
//!
//! Scrapes documentation pages, chunks them at one or more granularities, embeds
//! the chunks through a remote model and swaps the result in as a new table
//! generation without interrupting queries. Queries are embedded with the same
//! model and answered from the live generation by cosine distance.
//!
//! ## Key Modules
//!
//! - **[`retrieval`]**: scraper, embedding batcher, indexing pipeline, retrieval service
//! - **[`storage`]**: generation storage backends and the build lifecycle manager
//! - **[`config`]**: the validated [`DocragConfig`]
//! - **[`error`]**: error taxonomy and [`BuildError`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docrag_retriever::{DocragConfig, Services};
//! use docrag_retriever::retrieval::indexing_pipeline::BuildRequest;
//! use docrag_retriever::retrieval::retrieval_service::RetrievalQuery;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let services = Services::from_config(DocragConfig::load(None)?).await?;
//! services.pipeline.run(BuildRequest::default()).await?;
//!
//! let docs = services
//!     .retrieval
//!     .retrieve(&RetrievalQuery::new("How do I run a model from Python?").with_limit(5))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! URLs → HttpScraper → WindowChunker (per granularity) → EmbeddingBatcher
//!                                                            ↓
//!  query → RetrievalService → live ◀── deploy ◀── index ◀── staging ◀── populate
//! ```

pub mod config;
pub mod error;
pub mod retrieval;
pub mod services;
pub mod storage;

pub use config::DocragConfig;
pub use error::{BuildError, BuildStage, Error, ErrorKind, Result};
pub use services::Services;
