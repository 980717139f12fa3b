//! Domain types shared by the chunker, the vector index and the pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;

pub type TokenId = u32;

/// A half-open token range together with its decoded text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSpan {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

impl TokenSpan {
    pub fn new(range: Range<usize>, text: String) -> Self {
        Self { start: range.start, end: range.end, text }
    }

    pub fn token_count(&self) -> usize {
        self.end - self.start
    }
}

/// One window of the chunked token stream.
///
/// - `index`: zero-based position in the chunker output
/// - `start_token`/`end_token`: authoritative half-open token range
/// - `token_count`: always `end_token - start_token`
/// - `char_start`/`char_end`: best-effort offsets of `text` inside the source
///   text; `None` when the decoded text does not occur there verbatim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub start_token: usize,
    pub end_token: usize,
    pub token_count: usize,
    pub char_start: Option<usize>,
    pub char_end: Option<usize>,
}

impl Chunk {
    pub fn from_span(index: usize, span: TokenSpan) -> Self {
        let token_count = span.token_count();
        Self {
            index,
            text: span.text,
            start_token: span.start,
            end_token: span.end,
            token_count,
            char_start: None,
            char_end: None,
        }
    }
}

/// Metadata retained next to every indexed vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub position: usize,
    pub text: String,
    pub start_token: usize,
    pub end_token: usize,
    pub token_count: usize,
    pub char_start: Option<usize>,
    pub char_end: Option<usize>,
}

impl From<&Chunk> for ChunkMetadata {
    fn from(c: &Chunk) -> Self {
        Self {
            position: c.index,
            text: c.text.clone(),
            start_token: c.start_token,
            end_token: c.end_token,
            token_count: c.token_count,
            char_start: c.char_start,
            char_end: c.char_end,
        }
    }
}

/// One retained record of the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedVector {
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// A ranked search result. Higher `score` is better; cosine scores lie in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub metadata: ChunkMetadata,
    pub score: f32,
}

/// Similarity used by a search call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Plain dot product; only valid when both sides are unit length.
    Dot,
    Cosine,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub count: usize,
    pub dimension: usize,
    pub namespaces: BTreeMap<String, usize>,
    pub backend: String,
    pub metric: Metric,
}

/// Per-chunk entry of a [`SearchResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkResult {
    pub chunk_index: usize,
    pub score: f32,
    pub text: String,
    pub start_token: usize,
    pub end_token: usize,
    pub token_count: usize,
}

impl From<SearchHit> for ChunkResult {
    fn from(hit: SearchHit) -> Self {
        let m = hit.metadata;
        Self {
            chunk_index: m.position,
            score: hit.score,
            text: m.text,
            start_token: m.start_token,
            end_token: m.end_token,
            token_count: m.token_count,
        }
    }
}

/// Result of one page search: chunk, index and rank a single document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub source: String,
    pub query: String,
    pub total_chunks: usize,
    pub results: Vec<ChunkResult>,
    pub processing_time_ms: Option<f64>,
}
