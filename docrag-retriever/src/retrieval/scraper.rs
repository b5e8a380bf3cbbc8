//! Document fetching: turns a URL into a [`Document`].

use crate::error::{Error, Result, Upstream};
use async_trait::async_trait;
use docrag_context::Document;
use futures::stream::{self, StreamExt, TryStreamExt};
use scraper::{ElementRef, Html};
use std::time::Duration;

/// Anything that can produce the title and raw text of a page.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Document>;
}

/// Fetches pages over HTTP and extracts `<title>` and the text of `<body>`.
#[derive(Debug, Clone)]
pub struct HttpScraper {
    client: reqwest::Client,
}

impl HttpScraper {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("docrag/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::upstream(Upstream::Scraper, e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DocumentSource for HttpScraper {
    async fn fetch(&self, url: &str) -> Result<Document> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                tracing::warn!("Failed to fetch {}: {}", url, e);
                Error::upstream(Upstream::Scraper, e)
            })?;
        let html = response
            .text()
            .await
            .map_err(|e| Error::upstream(Upstream::Scraper, e))?;
        Ok(extract_document(url, &html))
    }
}

/// Parses an HTML page. Body text is the concatenation of its text nodes; newline
/// handling is left to the chunker.
pub fn extract_document(url: &str, html: &str) -> Document {
    let page = Html::parse_document(html);
    let mut title = None;
    let mut text = String::new();
    for element in page.root_element().descendants().filter_map(ElementRef::wrap) {
        match element.value().name() {
            "title" if title.is_none() => {
                let value = element.text().collect::<String>().trim().to_string();
                if !value.is_empty() {
                    title = Some(value);
                }
            }
            "body" if text.is_empty() => text = element.text().collect(),
            _ => {}
        }
    }
    Document::new(url, title, text)
}

/// Fetches every URL with at most `concurrency` requests in flight. The first
/// failure aborts the whole fetch. Result order is unspecified.
pub async fn fetch_all(
    source: &dyn DocumentSource,
    urls: &[String],
    concurrency: usize,
) -> Result<Vec<Document>> {
    let fetches: Vec<_> = urls.iter().map(|url| source.fetch(url)).collect();
    stream::iter(fetches)
        .buffer_unordered(concurrency.max(1))
        .try_collect()
        .await
}
