pub mod embedding_batcher;
pub mod indexing_pipeline;
pub mod retrieval_service;
pub mod scraper;
