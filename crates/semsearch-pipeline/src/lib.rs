use std::sync::Arc;
use std::time::Instant;

use tracing::{info, instrument};

use semsearch_core::chunker::{ChunkingConfig, TextChunker};
use semsearch_core::error::{Error, Result};
use semsearch_core::traits::{IndexStore, SearchEngine, TokenCodec};
use semsearch_core::types::{ChunkResult, SearchHit, SearchResponse};
use semsearch_vector::{MemoryStore, VectorIndex};

pub const MAX_QUERY_CHARS: usize = 500;

/// Namespace holding the chunks of one source document.
pub fn namespace_for(source: &str) -> String {
    let hash = blake3::hash(source.as_bytes()).to_hex();
    format!("page-{}", &hash[..16])
}

/// Trimmed query, rejected when blank or longer than [`MAX_QUERY_CHARS`].
pub fn validate_query(query: &str) -> Result<&str> {
    let q = query.trim();
    if q.is_empty() {
        return Err(Error::InvalidInput("query must not be empty".into()));
    }
    if q.chars().count() > MAX_QUERY_CHARS {
        return Err(Error::InvalidInput(format!("query exceeds {MAX_QUERY_CHARS} characters")));
    }
    Ok(q)
}

/// Chunk -> embed -> rank over a shared [`VectorIndex`].
pub struct PageSearchEngine<S: IndexStore = MemoryStore> {
    chunker: TextChunker,
    index: Arc<VectorIndex<S>>,
    max_top_k: usize,
}

impl<S: IndexStore> PageSearchEngine<S> {
    pub fn new(chunker: TextChunker, index: Arc<VectorIndex<S>>) -> Self {
        Self { chunker, index, max_top_k: usize::MAX }
    }

    /// Chunk with `config`, shrunk to the embedder's input limit when larger.
    pub fn fitted(codec: Arc<dyn TokenCodec>, config: ChunkingConfig, index: Arc<VectorIndex<S>>) -> Result<Self> {
        let config = config.fit_to(index.max_input_tokens())?;
        Ok(Self::new(TextChunker::new(codec, config)?, index))
    }

    pub fn chunking(&self) -> ChunkingConfig {
        self.chunker.config()
    }

    pub fn with_max_top_k(mut self, max_top_k: usize) -> Self {
        self.max_top_k = max_top_k;
        self
    }

    pub fn vector_index(&self) -> &Arc<VectorIndex<S>> {
        &self.index
    }

    /// Replace `namespace` with the chunks of `text`; returns the chunk count.
    #[instrument(skip(self, text), fields(chars = text.len()))]
    pub fn ingest(&self, namespace: &str, text: &str) -> Result<usize> {
        let chunks = self.chunker.chunk_text(text)?;
        self.index.index_in(namespace, &chunks)?;
        Ok(chunks.len())
    }

    fn check_top_k(&self, top_k: usize) -> Result<()> {
        if top_k == 0 || top_k > self.max_top_k {
            return Err(Error::InvalidInput(format!("top_k must be between 1 and {}", self.max_top_k)));
        }
        Ok(())
    }

    pub fn query(&self, namespace: &str, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        let q = validate_query(query)?;
        self.check_top_k(top_k)?;
        self.index.search_in(namespace, q, top_k)
    }

    /// One-shot search of a single document: chunk and index `text` under a
    /// namespace derived from `source`, then rank its chunks against `query`.
    pub fn search_page(&self, source: &str, text: &str, query: &str, top_k: usize) -> Result<SearchResponse> {
        let started = Instant::now();
        let q = validate_query(query)?.to_string();
        self.check_top_k(top_k)?;
        let namespace = namespace_for(source);

        let total_chunks = self.ingest(&namespace, text)?;
        let hits = self.query(&namespace, &q, top_k)?;
        let elapsed = started.elapsed().as_secs_f64() * 1000.0;
        info!(source, total_chunks, results = hits.len(), ms = elapsed, "page search complete");

        Ok(SearchResponse {
            source: source.to_string(),
            query: q,
            total_chunks,
            results: hits.into_iter().map(ChunkResult::from).collect(),
            processing_time_ms: Some(elapsed),
        })
    }
}

impl<S: IndexStore> SearchEngine for PageSearchEngine<S> {
    fn index(&self, namespace: &str, text: &str) -> Result<usize> {
        self.ingest(namespace, text)
    }

    fn query(&self, namespace: &str, query: &str, k: usize) -> Result<Vec<SearchHit>> {
        Self::query(self, namespace, query, k)
    }
}
