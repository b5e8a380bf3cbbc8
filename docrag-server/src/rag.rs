//! Retrieval-augmented answers: retrieve documentation, build a prompt, start an
//! LLM prediction and hand the caller the prediction handle.
//!
//! The prediction is created without waiting for it to finish. Callers either poll
//! `urls.get` themselves or pass a webhook, which Replicate calls with the output
//! as it streams in. A correlation `key` supplied by the caller is appended to the
//! webhook URL so the receiving side can match callbacks to requests.

use async_trait::async_trait;
use docrag_embed::{EmbedError, Prediction, PredictionRequest, ReplicateClient};
use docrag_retriever::config::RagConfig;
use docrag_retriever::retrieval::retrieval_service::{RetrievalQuery, RetrievalService};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Anything that can start an LLM prediction.
#[async_trait]
pub trait PredictionBackend: Send + Sync {
    async fn create(&self, request: &PredictionRequest) -> docrag_embed::Result<Prediction>;
}

#[async_trait]
impl PredictionBackend for ReplicateClient {
    async fn create(&self, request: &PredictionRequest) -> docrag_embed::Result<Prediction> {
        self.create_prediction(request, false).await
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RagRequest {
    pub text: String,
    /// Callback URL for prediction events
    #[serde(default)]
    pub webhook: Option<String>,
    /// Correlation token appended to the webhook as `key=<token>`
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Retrieval(#[from] docrag_retriever::Error),
    #[error("language model unavailable: {0}")]
    Llm(#[source] EmbedError),
}

pub struct RagOrchestrator {
    retrieval: Arc<RetrievalService>,
    backend: Arc<dyn PredictionBackend>,
    config: RagConfig,
}

impl RagOrchestrator {
    pub fn new(
        retrieval: Arc<RetrievalService>,
        backend: Arc<dyn PredictionBackend>,
        config: RagConfig,
    ) -> Self {
        Self {
            retrieval,
            backend,
            config,
        }
    }

    /// Retrieves context for `request.text` and starts the answering prediction.
    pub async fn answer(&self, request: &RagRequest) -> Result<Prediction, RagError> {
        let webhook = match &request.webhook {
            Some(url) => Some(webhook_url(url, request.key.as_deref())?),
            None => None,
        };

        let query = RetrievalQuery::new(request.text.clone())
            .with_content_length(self.config.content_length)
            .with_limit(self.config.limit as i64);
        let documents = self.retrieval.retrieve(&query).await?;
        let pages: Vec<String> = documents.into_iter().filter_map(|d| d.content).collect();
        info!("Retrieved {} pages for RAG prompt", pages.len());

        let input = json!({
            "prompt": build_prompt(&request.text, &pages),
            "temperature": self.config.temperature,
            "max_new_tokens": self.config.max_new_tokens,
        });
        let mut prediction = PredictionRequest::new(&self.config.llm_version, input);
        if let Some(url) = webhook {
            prediction = prediction.with_webhook(url, self.config.webhook_events.clone());
        }

        let created = self.backend.create(&prediction).await.map_err(RagError::Llm)?;
        info!("Created prediction {} ({:?})", created.id, created.status);
        Ok(created)
    }
}

/// Instruction-formatted prompt with the representative persona, the retrieved
/// pages and the question.
pub fn build_prompt(question: &str, pages: &[String]) -> String {
    format!(
        "[INST]\n\
You are a very enthusiastic Replicate representative who loves to help people! \
Your goal is to answer the question that will help the user use Replicate. \
You will be given a USER_PROMPT, and a series of DOCUMENTATION_PAGES. \
You will respond with an answer.\n\
\n\
If you are unsure and the answer is not explicitly written in the documentation, \
say \"Sorry, I don't know how to help with that.\". \
Do not answer with something that is not written in the documentation.\n\
\n\
USER_PROMPT: {question}\n\
\n\
DOCUMENTATION_PAGES: {}\n\
\n\
ANSWER:\n\
\n\
[/INST]",
        pages.join("\n")
    )
}

/// Appends `key=<token>` to the webhook URL, keeping any existing query.
pub fn webhook_url(base: &str, key: Option<&str>) -> Result<String, RagError> {
    let mut url = reqwest::Url::parse(base)
        .map_err(|e| RagError::InvalidRequest(format!("webhook is not a valid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RagError::InvalidRequest(
            "webhook must be an http(s) URL".to_string(),
        ));
    }
    if let Some(key) = key {
        url.query_pairs_mut().append_pair("key", key);
    }
    Ok(url.into())
}
