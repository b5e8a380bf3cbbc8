use crate::rag::{RagError, RagOrchestrator, RagRequest};
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use docrag_embed::Prediction;
use docrag_retriever::retrieval::indexing_pipeline::{BuildReport, BuildRequest};
use docrag_retriever::retrieval::retrieval_service::{RetrievalQuery, RetrievedDocument};
use docrag_retriever::storage::StoreStatus;
use docrag_retriever::{BuildError, BuildStage, Error, ErrorKind, Services};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Seconds a client should wait before retrying while no index is live.
const RETRY_AFTER_SECS: &str = "30";

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub rag: Arc<RagOrchestrator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/indexer", post(indexer))
        .route("/api/retrieve", post(retrieve))
        .route("/api/rag", post(rag))
        .route("/api/status", get(status))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Runs a build. The body is optional; an empty body builds with the configured
/// defaults.
async fn indexer(State(state): State<AppState>, body: Bytes) -> Result<Json<BuildReport>, ApiError> {
    let request: BuildRequest = if body.iter().all(u8::is_ascii_whitespace) {
        BuildRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    if state.services.pipeline.is_building() {
        return Err(ApiError::Conflict("a build is already running".to_string()));
    }
    info!("Build triggered over HTTP");
    let report = state.services.pipeline.run(request).await?;
    Ok(Json(report))
}

async fn retrieve(
    State(state): State<AppState>,
    payload: Result<Json<RetrievalQuery>, JsonRejection>,
) -> Result<Json<Vec<RetrievedDocument>>, ApiError> {
    let Json(query) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let documents = state.services.retrieval.retrieve(&query).await?;
    Ok(Json(documents))
}

async fn rag(
    State(state): State<AppState>,
    payload: Result<Json<RagRequest>, JsonRejection>,
) -> Result<Json<Prediction>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let prediction = state.rag.answer(&request).await?;
    Ok(Json(prediction))
}

async fn status(State(state): State<AppState>) -> Result<Json<StoreStatus>, ApiError> {
    Ok(Json(state.services.store.status().await?))
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Conflict(String),
    Llm(String),
    Retrieval(Error),
    Build(BuildError),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::Retrieval(e)
    }
}

impl From<BuildError> for ApiError {
    fn from(e: BuildError) -> Self {
        Self::Build(e)
    }
}

impl From<RagError> for ApiError {
    fn from(e: RagError) -> Self {
        match e {
            RagError::InvalidRequest(message) => Self::BadRequest(message),
            RagError::Retrieval(e) => Self::Retrieval(e),
            llm @ RagError::Llm(_) => Self::Llm(llm.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<BuildStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total: Option<usize>,
}

impl ErrorBody {
    fn new(error: impl ToString, message: impl ToString) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            stage: None,
            completed: None,
            total: None,
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::NotReady => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
        ErrorKind::ConsistencyViolation | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                ErrorBody::new(ErrorKind::InvalidInput, message),
            ),
            Self::Conflict(message) => (StatusCode::CONFLICT, ErrorBody::new("conflict", message)),
            Self::Llm(message) => (
                StatusCode::BAD_GATEWAY,
                ErrorBody::new(ErrorKind::UpstreamUnavailable, message),
            ),
            Self::Retrieval(e) => (status_for(e.kind()), ErrorBody::new(e.kind(), &e)),
            Self::Build(e) => {
                let mut body = ErrorBody::new(e.kind(), &e);
                body.stage = Some(e.stage);
                body.completed = e.completed;
                body.total = e.total;
                (status_for(e.kind()), body)
            }
        };
        if status.is_server_error() {
            warn!("Request failed with {}: {}", status, body.message);
        }

        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}
