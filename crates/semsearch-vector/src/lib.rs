pub mod lance;
pub mod memory;
pub mod ranking;
pub mod schema;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::{debug, info, warn};

use semsearch_core::error::{Error, Result};
use semsearch_core::traits::{Embedder, IndexStore};
use semsearch_core::types::{Chunk, ChunkMetadata, IndexStats, IndexedVector, Metric, SearchHit};

pub use lance::LanceStore;
pub use memory::MemoryStore;

pub const DEFAULT_NAMESPACE: &str = "";
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Embeds chunks and ranks them against queries.
///
/// Indexing replaces a namespace's contents wholesale. The new record set is
/// fully embedded and checked before it is handed to the store, so a failed
/// call leaves the previous contents searchable.
pub struct VectorIndex<S: IndexStore = MemoryStore> {
    embedder: Box<dyn Embedder>,
    store: S,
    dimension: usize,
    normalized: bool,
    batch_size: usize,
    show_progress: bool,
}

impl VectorIndex<MemoryStore> {
    pub fn in_memory(embedder: Box<dyn Embedder>) -> Self {
        Self::with_store(embedder, MemoryStore::new())
    }
}

impl<S: IndexStore> VectorIndex<S> {
    pub fn with_store(embedder: Box<dyn Embedder>, store: S) -> Self {
        let dimension = embedder.dim();
        let normalized = embedder.normalized();
        info!(dimension, normalized, backend = store.name(), "initialized vector index");
        Self { embedder, store, dimension, normalized, batch_size: DEFAULT_BATCH_SIZE, show_progress: false }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Longest input, in tokens, the embedder accepts without truncating.
    pub fn max_input_tokens(&self) -> usize {
        self.embedder.max_len()
    }

    pub fn metric(&self) -> Metric {
        if self.normalized { Metric::Dot } else { Metric::Cosine }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn index(&self, chunks: &[Chunk]) -> Result<()> {
        self.index_in(DEFAULT_NAMESPACE, chunks)
    }

    pub fn index_in(&self, namespace: &str, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Err(Error::EmptyInput);
        }
        info!(namespace, chunks = chunks.len(), "indexing chunks");
        let records = self.embed_chunks(chunks)?;
        self.store.replace(namespace, records)?;
        info!(namespace, count = chunks.len(), "index replaced");
        Ok(())
    }

    fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<IndexedVector>> {
        let pb = self.progress_bar(chunks.len());
        let mut records = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).map_err(Error::embedder)?;
            if vectors.len() != batch.len() {
                return Err(Error::embedder(anyhow::anyhow!(
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }
            for (chunk, vector) in batch.iter().zip(vectors) {
                if vector.len() != self.dimension {
                    return Err(Error::DimensionMismatch { expected: self.dimension, actual: vector.len() });
                }
                records.push(IndexedVector { vector, metadata: ChunkMetadata::from(chunk) });
            }
            pb.inc(batch.len() as u64);
        }
        pb.finish_and_clear();
        Ok(records)
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::with_draw_target(Some(len as u64), ProgressDrawTarget::stderr());
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({percent}%)")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }

    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        self.search_in(DEFAULT_NAMESPACE, query, top_k)
    }

    pub fn search_in(&self, namespace: &str, query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        if top_k == 0 {
            return Err(Error::InvalidInput("top_k must be at least 1".into()));
        }
        let snapshot = self.store.snapshot(namespace)?.ok_or(Error::NotIndexed)?;

        let mut query_vector = self.embedder.embed(query).map_err(Error::embedder)?;
        if query_vector.len() != self.dimension {
            return Err(Error::DimensionMismatch { expected: self.dimension, actual: query_vector.len() });
        }
        if !self.normalized {
            ranking::normalize(&mut query_vector);
        }
        let hits = ranking::top_k(&query_vector, &snapshot, top_k, self.metric())?;
        debug!(namespace, top_k, returned = hits.len(), "search complete");
        Ok(hits)
    }

    /// Remove every namespace. Idempotent.
    pub fn clear(&self) -> Result<()> {
        self.store.clear(None)?;
        info!("index cleared");
        Ok(())
    }

    pub fn clear_in(&self, namespace: &str) -> Result<()> {
        self.store.clear(Some(namespace))
    }

    /// Never fails: an unreachable backend is reported as an empty index.
    pub fn stats(&self) -> IndexStats {
        let namespaces = self.store.namespaces().unwrap_or_else(|e| {
            warn!(error = %e, "failed to read index stats");
            Default::default()
        });
        IndexStats {
            count: namespaces.values().sum(),
            dimension: self.dimension,
            namespaces,
            backend: self.store.name().to_string(),
            metric: self.metric(),
        }
    }
}
