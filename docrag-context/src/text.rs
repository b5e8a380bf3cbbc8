//! Text normalization and fixed-window chunking for scraped documentation pages.
//!
//! Scraped page text is turned into embedding-ready [`Chunk`]s in two pure steps:
//!
//! 1. [`normalize_text`] collapses line breaks to spaces and rewrites every non-ASCII
//!    character as a `\u{XXXX}` codepoint escape, so the stored text is plain ASCII and
//!    survives JSON transport and database round trips byte-for-byte.
//! 2. [`split_windows`] cuts the normalized text into consecutive, non-overlapping
//!    windows of exactly `window_size` characters; only the final window may be shorter.
//!
//! [`WindowChunker`] ties the two together for a single granularity. Several chunkers
//! with different window sizes may be run over the same [`Document`]; the resulting
//! chunk sets are independent of each other.
//!
//! # Example
//!
//! ```
//! use docrag_context::text::{Document, WindowChunker};
//! use std::num::NonZeroUsize;
//!
//! let document = Document::new("https://example.com/docs", Some("Docs".to_string()), "abcdefg");
//! let chunker = WindowChunker::new(NonZeroUsize::new(3).unwrap());
//! let chunks = chunker.get_chunks(&document);
//!
//! let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
//! assert_eq!(contents, vec!["abc", "def", "g"]);
//! assert!(chunks.iter().all(|c| c.content_length == 3 && c.embedding.is_none()));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::num::NonZeroUsize;

/// A scraped page: source URL, optional title and the raw extracted text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub url: String,
    pub title: Option<String>,
    pub text: String,
}

impl Document {
    pub fn new(url: impl Into<String>, title: Option<String>, text: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title,
            text: text.into(),
        }
    }
}

/// A fixed-length slice of a document's normalized text.
///
/// `content_length` is the window size that produced the chunk, not the length of
/// `content`; the final chunk of a document may be shorter than its window.
/// `embedding` stays `None` until the embedding stage fills it in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub title: Option<String>,
    pub url: String,
    pub content: String,
    pub content_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Normalizes raw page text into the ASCII-only form that is chunked and embedded.
///
/// Every `\n` and `\r` becomes a single space. Every non-ASCII character is replaced by
/// its codepoint escape, lowercase hex padded to at least four digits (`é` → `\u{00e9}`,
/// `😀` → `\u{1f600}`). ASCII characters pass through untouched, so ASCII text without
/// line breaks is returned unchanged.
pub fn normalize_text(raw: &str) -> String {
    let mut normalized = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\n' | '\r' => normalized.push(' '),
            c if c.is_ascii() => normalized.push(c),
            c => {
                // Writing into a String cannot fail.
                let _ = write!(normalized, "\\u{{{:04x}}}", c as u32);
            }
        }
    }
    normalized
}

/// Splits `text` into consecutive windows of `window_size` characters.
///
/// Windows never overlap and are returned in source order. Every window except possibly
/// the last holds exactly `window_size` characters, so an input of `L` characters yields
/// `ceil(L / window_size)` windows and an empty input yields none. Concatenating the
/// windows reproduces `text` exactly.
pub fn split_windows(text: &str, window_size: NonZeroUsize) -> Vec<&str> {
    let window_size = window_size.get();
    let mut windows = Vec::new();
    let mut start = 0;
    let mut count = 0;

    for (offset, _) in text.char_indices() {
        if count == window_size {
            windows.push(&text[start..offset]);
            start = offset;
            count = 0;
        }
        count += 1;
    }
    if count > 0 {
        windows.push(&text[start..]);
    }
    windows
}

/// Chunks documents at a single granularity.
#[derive(Debug, Clone, Copy)]
pub struct WindowChunker {
    window_size: NonZeroUsize,
}

impl WindowChunker {
    pub fn new(window_size: NonZeroUsize) -> Self {
        Self { window_size }
    }

    pub fn window_size(&self) -> usize {
        self.window_size.get()
    }

    /// Normalizes the document text and cuts it into chunks of this chunker's window size.
    ///
    /// The chunks carry the document's URL and title, `content_length` set to the window
    /// size and no embedding. A document with empty text produces no chunks.
    ///
    /// Windows are cut after normalization, so a `\u{..}` escape may straddle two
    /// chunks. Concatenating the chunks still reproduces the normalized text.
    pub fn get_chunks(&self, document: &Document) -> Vec<Chunk> {
        let normalized = normalize_text(&document.text);
        split_windows(&normalized, self.window_size)
            .into_iter()
            .map(|content| Chunk {
                title: document.title.clone(),
                url: document.url.clone(),
                content: content.to_string(),
                content_length: self.window_size.get(),
                embedding: None,
            })
            .collect()
    }
}
