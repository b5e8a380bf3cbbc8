//! Minimal client for Replicate's predictions API.
//!
//! A prediction is created with `POST {api_base}/predictions`. Requests sent through
//! [`ReplicateClient::run`] ask the API to hold the connection open (`Prefer: wait`)
//! and fall back to polling the prediction's `urls.get` endpoint until it reaches a
//! terminal status. [`ReplicateClient::create_prediction`] returns immediately, which is
//! what webhook-driven callers want.
//!
//! The client never retries on its own: remote predictions are billed per call, so a
//! failed call surfaces to the caller, which decides whether to repeat the whole unit
//! of work.

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::debug;

/// Body of a prediction creation request.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionRequest {
    pub version: String,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub webhook_events_filter: Vec<String>,
}

impl PredictionRequest {
    pub fn new(version: impl Into<String>, input: Value) -> Self {
        Self {
            version: version.into(),
            input,
            webhook: None,
            webhook_events_filter: Vec::new(),
        }
    }

    /// Ask Replicate to call `url` back for the given event types.
    pub fn with_webhook(mut self, url: impl Into<String>, events: Vec<String>) -> Self {
        self.webhook = Some(url.into());
        self.webhook_events_filter = events;
        self
    }
}

/// Lifecycle state of a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl PredictionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// Links returned with a prediction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictionUrls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
}

/// A prediction as reported by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub status: PredictionStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub urls: PredictionUrls,
}

/// Async HTTP client for the predictions API.
#[derive(Clone)]
pub struct ReplicateClient {
    http: reqwest::Client,
    predictions_url: String,
    poll_interval: Duration,
    max_wait: Duration,
}

impl std::fmt::Debug for ReplicateClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicateClient")
            .field("predictions_url", &self.predictions_url)
            .field("poll_interval", &self.poll_interval)
            .field("max_wait", &self.max_wait)
            .finish()
    }
}

impl ReplicateClient {
    /// Builds a client from a validated embedding configuration.
    pub fn from_config(config: &EmbedConfig) -> Result<Self> {
        config.validate()?;
        Self::new(
            &config.api_base,
            &config.api_token,
            config.request_timeout(),
            config.poll_interval(),
            config.max_wait(),
        )
    }

    pub fn new(
        api_base: &str,
        api_token: &str,
        request_timeout: Duration,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_token.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| EmbedError::invalid_config("API token is not a valid header"))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            predictions_url: format!("{}/predictions", api_base.trim_end_matches('/')),
            poll_interval,
            max_wait,
        })
    }

    /// Creates a prediction. With `wait` the API may hold the request open until the
    /// prediction finishes; the returned prediction is not necessarily terminal.
    pub async fn create_prediction(
        &self,
        request: &PredictionRequest,
        wait: bool,
    ) -> Result<Prediction> {
        let mut builder = self.http.post(&self.predictions_url).json(request);
        if wait {
            builder = builder.header("Prefer", "wait");
        }
        let response = builder.send().await?;
        Self::parse_prediction(response).await
    }

    /// Fetches the current state of a prediction from its `urls.get` link.
    pub async fn get_prediction(&self, url: &str) -> Result<Prediction> {
        let response = self.http.get(url).send().await?;
        Self::parse_prediction(response).await
    }

    /// Runs a prediction to completion and returns its output.
    ///
    /// # Errors
    /// - [`EmbedError::Provider`] for non-success responses, failed or canceled predictions
    /// - [`EmbedError::Timeout`] when the prediction is still running after `max_wait`
    /// - [`EmbedError::Request`] for transport failures
    pub async fn run(&self, request: &PredictionRequest) -> Result<Value> {
        let started = Instant::now();
        let mut prediction = self.create_prediction(request, true).await?;
        debug!(
            "Created prediction {} with status {:?}",
            prediction.id, prediction.status
        );

        while !prediction.status.is_terminal() {
            if started.elapsed() >= self.max_wait {
                return Err(EmbedError::Timeout {
                    prediction_id: prediction.id,
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            let Some(url) = prediction.urls.get.clone() else {
                return Err(EmbedError::provider(
                    200,
                    format!("prediction {} has no status URL", prediction.id),
                ));
            };
            tokio::time::sleep(self.poll_interval).await;
            prediction = self.get_prediction(&url).await?;
            debug!("Polled prediction {}: {:?}", prediction.id, prediction.status);
        }

        match prediction.status {
            PredictionStatus::Succeeded => prediction.output.ok_or_else(|| {
                EmbedError::provider(200, format!("prediction {} has no output", prediction.id))
            }),
            status => Err(EmbedError::provider(
                200,
                format!(
                    "prediction {} ended as {:?}: {}",
                    prediction.id,
                    status,
                    prediction
                        .error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "no error detail".to_string())
                ),
            )),
        }
    }

    async fn parse_prediction(response: reqwest::Response) -> Result<Prediction> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(EmbedError::provider(status.as_u16(), body));
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
