//! # docrag-server
//!
//! HTTP front end for the docrag index. It exposes the build trigger, the retrieval
//! query and the RAG orchestrator over JSON:
//!
//! | Route | Method | Body | Response |
//! |---|---|---|---|
//! | `/api/indexer` | POST | optional [`BuildRequest`] overrides | [`BuildReport`] |
//! | `/api/retrieve` | POST | `{text, content_length?, limit?, include_content?}` | documents, nearest first |
//! | `/api/rag` | POST | `{text, webhook?, key?}` | the created prediction |
//! | `/api/status` | GET | | live generation and staging state |
//! | `/healthz` | GET | | `200` |
//!
//! Errors are returned as `{"error": kind, "message": text}`; build failures also
//! carry `stage` and, for embed and populate, `completed`/`total`. A query that
//! arrives before the first deploy gets `503` with `Retry-After`.
//!
//! [`BuildRequest`]: docrag_retriever::retrieval::indexing_pipeline::BuildRequest
//! [`BuildReport`]: docrag_retriever::retrieval::indexing_pipeline::BuildReport

pub mod rag;
mod server;

pub use server::{ApiError, AppState, router};

use anyhow::{Context, Result};
use docrag_embed::ReplicateClient;
use docrag_retriever::{DocragConfig, Services};
use rag::RagOrchestrator;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
        }
    }
}

/// Wires the Replicate-backed services and serves until the process is stopped.
pub async fn run_server(server: ServerConfig, config: DocragConfig) -> Result<()> {
    info!(
        "Starting docrag server on {} (database {})",
        server.bind,
        config.database.redacted_url()
    );
    let llm = ReplicateClient::from_config(&config.embedding).context("creating LLM client")?;
    let rag_config = config.rag.clone();
    let services = Services::from_config(config)
        .await
        .context("initializing docrag")?;
    let rag = RagOrchestrator::new(Arc::clone(&services.retrieval), Arc::new(llm), rag_config);

    let app = router(AppState {
        services,
        rag: Arc::new(rag),
    });
    let listener = tokio::net::TcpListener::bind(server.bind)
        .await
        .with_context(|| format!("binding {}", server.bind))?;
    info!("Listening on {}", server.bind);
    axum::serve(listener, app).await.context("server shutdown")?;
    Ok(())
}
