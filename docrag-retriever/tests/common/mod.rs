//! Shared fixtures: an in-process embedding model and a static page source.

#![allow(dead_code)]

use async_trait::async_trait;
use docrag_context::Document;
use docrag_embed::{EmbeddingProvider, EmbeddingResult};
use docrag_retriever::retrieval::scraper::DocumentSource;
use docrag_retriever::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const LETTER_MODEL: &str = "test/letter-histogram";

/// Embeds text as its a-z letter histogram (26 dimensions). Texts made of one
/// repeated letter are orthogonal to each other.
#[derive(Default)]
pub struct LetterHistogram {
    calls: AtomicUsize,
}

impl LetterHistogram {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn histogram(text: &str) -> Vec<f32> {
    let mut counts = vec![0.0f32; 26];
    for c in text.chars().filter(|c| c.is_ascii_lowercase()) {
        counts[(c as u8 - b'a') as usize] += 1.0;
    }
    counts
}

#[async_trait]
impl EmbeddingProvider for LetterHistogram {
    async fn embed_texts(&self, texts: &[String]) -> docrag_embed::Result<EmbeddingResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(EmbeddingResult::new(texts.iter().map(|t| histogram(t)).collect()))
    }

    fn embedding_dimension(&self) -> usize {
        26
    }

    fn provider_name(&self) -> &str {
        "letter-histogram"
    }

    fn model_name(&self) -> &str {
        LETTER_MODEL
    }
}

/// Serves fixed documents by URL.
pub struct StaticSource {
    pages: HashMap<String, Document>,
}

impl StaticSource {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            pages: documents.into_iter().map(|d| (d.url.clone(), d)).collect(),
        }
    }
}

#[async_trait]
impl DocumentSource for StaticSource {
    async fn fetch(&self, url: &str) -> Result<Document> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| Error::invalid_input(format!("no such page: {url}")))
    }
}

/// The three-document corpus: 250 chars of `d`, 1500 chars as 500 `a`, 500 `b`,
/// 500 `c`, and an empty page.
pub fn three_documents() -> Vec<Document> {
    vec![
        Document::new("https://docs.test/short", Some("Short".to_string()), "d".repeat(250)),
        Document::new(
            "https://docs.test/long",
            Some("Long".to_string()),
            format!("{}{}{}", "a".repeat(500), "b".repeat(500), "c".repeat(500)),
        ),
        Document::new("https://docs.test/empty", Some("Empty".to_string()), ""),
    ]
}
