use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use proptest::prelude::*;

use semsearch_core::error::{CollaboratorKind, Error};
use semsearch_core::traits::Embedder;
use semsearch_core::types::{Chunk, Metric, TokenSpan};
use semsearch_embed::FakeEmbedder;
use semsearch_vector::{LanceStore, VectorIndex};

fn chunks(texts: &[&str]) -> Vec<Chunk> {
    texts
        .iter()
        .enumerate()
        .map(|(i, t)| Chunk::from_span(i, TokenSpan::new(i * 10..i * 10 + 10, t.to_string())))
        .collect()
}

fn languages() -> Vec<Chunk> {
    chunks(&[
        "Python is used for data science",
        "JavaScript is used for web development",
        "Java is used for enterprise applications",
    ])
}

/// Wraps the fake embedder and starts failing once `broken` is set.
struct Flaky {
    inner: FakeEmbedder,
    broken: Arc<AtomicBool>,
}

impl Embedder for Flaky {
    fn dim(&self) -> usize {
        self.inner.dim()
    }
    fn max_len(&self) -> usize {
        self.inner.max_len()
    }
    fn normalized(&self) -> bool {
        true
    }
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if self.broken.load(Ordering::SeqCst) && texts.len() > 1 {
            anyhow::bail!("embedding service unavailable");
        }
        self.inner.embed_batch(texts)
    }
}

/// Returns vectors of the wrong width.
struct Wide;

impl Embedder for Wide {
    fn dim(&self) -> usize {
        4
    }
    fn max_len(&self) -> usize {
        64
    }
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![1.0; 5]).collect())
    }
}

/// Drops the last vector of every batch.
struct Short;

impl Embedder for Short {
    fn dim(&self) -> usize {
        2
    }
    fn max_len(&self) -> usize {
        64
    }
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().skip(1).map(|_| vec![1.0, 0.0]).collect())
    }
}

/// Fake vectors stretched by text length, so magnitudes differ per input.
struct Scaled(FakeEmbedder);

impl Embedder for Scaled {
    fn dim(&self) -> usize {
        self.0.dim()
    }
    fn max_len(&self) -> usize {
        self.0.max_len()
    }
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let vectors = self.0.embed_batch(texts)?;
        Ok(texts
            .iter()
            .zip(vectors)
            .map(|(t, v)| v.into_iter().map(|x| x * (1 + t.len()) as f32).collect())
            .collect())
    }
}

/// Right width for documents, one too wide for queries mentioning "wide".
struct QueryWidth;

impl Embedder for QueryWidth {
    fn dim(&self) -> usize {
        4
    }
    fn max_len(&self) -> usize {
        64
    }
    fn normalized(&self) -> bool {
        true
    }
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| vec![0.5; if t.contains("wide") { 5 } else { 4 }]).collect())
    }
}

fn index() -> VectorIndex {
    VectorIndex::in_memory(Box::new(FakeEmbedder::new(384)))
}

#[test]
fn python_chunk_ranks_first_for_data_query() {
    let idx = index();
    idx.index(&languages()).expect("index");
    let hits = idx.search("programming language for data analysis", 2).expect("search");
    assert_eq!(hits.len(), 2);
    assert!(hits[0].metadata.text.contains("Python"), "top hit: {}", hits[0].metadata.text);
    assert!(hits[0].score >= hits[1].score);
}

#[test]
fn search_before_index_is_not_indexed() {
    assert!(matches!(index().search("anything", 3), Err(Error::NotIndexed)));
}

#[test]
fn empty_index_call_keeps_prior_state() {
    let idx = index();
    assert!(matches!(idx.index(&[]), Err(Error::EmptyInput)));
    idx.index(&languages()).unwrap();
    assert!(matches!(idx.index(&[]), Err(Error::EmptyInput)));
    assert_eq!(idx.search("web development", 1).unwrap().len(), 1);
    assert_eq!(idx.stats().count, 3);
}

#[test]
fn reindex_replaces_instead_of_merging() {
    let idx = index();
    idx.index(&languages()).unwrap();
    idx.index(&chunks(&["Rust is used for systems programming", "Go is used for services"])).unwrap();

    let stats = idx.stats();
    assert_eq!(stats.count, 2);
    assert_eq!(stats.dimension, 384);
    assert_eq!(stats.metric, Metric::Dot);
    assert_eq!(stats.backend, "memory");

    let hits = idx.search("Python data science", 10).unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| !h.metadata.text.contains("Python")));
}

#[test]
fn failed_embedding_leaves_old_index_queryable() {
    let broken = Arc::new(AtomicBool::new(false));
    let idx = VectorIndex::in_memory(Box::new(Flaky { inner: FakeEmbedder::new(64), broken: broken.clone() }));
    idx.index(&languages()).unwrap();

    broken.store(true, Ordering::SeqCst);
    let err = idx.index(&chunks(&["one", "two"])).unwrap_err();
    assert!(matches!(err, Error::Collaborator { kind: CollaboratorKind::Embedder, .. }));

    let hits = idx.search("Java enterprise", 3).unwrap();
    assert_eq!(hits.len(), 3);
    assert_eq!(idx.stats().count, 3);
}

#[test]
fn wrong_vector_width_is_dimension_mismatch() {
    let idx = VectorIndex::in_memory(Box::new(Wide));
    let err = idx.index(&chunks(&["a"])).unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { expected: 4, actual: 5 }));
    assert_eq!(idx.stats().count, 0);
}

#[test]
fn short_embedder_output_is_rejected() {
    let idx = VectorIndex::in_memory(Box::new(Short));
    let err = idx.index(&chunks(&["a", "b"])).unwrap_err();
    assert!(matches!(err, Error::Collaborator { kind: CollaboratorKind::Embedder, .. }));
}

#[test]
fn clear_is_idempotent() {
    let idx = index();
    idx.index(&languages()).unwrap();
    idx.clear().unwrap();
    idx.clear().unwrap();
    assert!(matches!(idx.search("Python", 1), Err(Error::NotIndexed)));
    assert_eq!(idx.stats().count, 0);
}

#[test]
fn zero_top_k_is_rejected() {
    let idx = index();
    idx.index(&languages()).unwrap();
    assert!(matches!(idx.search("Python", 0), Err(Error::InvalidInput(_))));
}

#[test]
fn namespaces_are_isolated() {
    let idx = index();
    idx.index_in("a", &languages()).unwrap();
    idx.index_in("b", &chunks(&["Rust is used for systems programming"])).unwrap();
    idx.index_in("a", &chunks(&["Python only"])).unwrap();

    let stats = idx.stats();
    assert_eq!(stats.count, 2);
    assert_eq!(stats.namespaces.get("a"), Some(&1));
    assert_eq!(stats.namespaces.get("b"), Some(&1));
    assert_eq!(idx.search_in("b", "Rust", 5).unwrap()[0].metadata.text, "Rust is used for systems programming");

    idx.clear_in("a").unwrap();
    assert!(matches!(idx.search_in("a", "Python", 1), Err(Error::NotIndexed)));
    assert_eq!(idx.search_in("b", "Rust", 5).unwrap().len(), 1);
}

#[test]
fn repeated_searches_are_identical() {
    let idx = index();
    let texts: Vec<String> = (0..40).map(|i| format!("item {} shared words here", i % 7)).collect();
    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    idx.index(&chunks(&refs)).unwrap();
    let a = idx.search("shared item 3", 15).unwrap();
    let b = idx.search("shared item 3", 15).unwrap();
    assert_eq!(a, b);
}

#[test]
fn lance_backed_index_matches_memory_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let uri = dir.path().join("lancedb");
    let store = LanceStore::open(uri.to_str().unwrap(), "html_chunks", 384).unwrap();
    let idx = VectorIndex::with_store(Box::new(FakeEmbedder::new(384)), store).with_batch_size(2);

    assert!(matches!(idx.search("Python", 1), Err(Error::NotIndexed)));
    idx.index(&languages()).unwrap();
    let hits = idx.search("programming language for data analysis", 2).unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits[0].metadata.text.contains("Python"));

    idx.index(&chunks(&["Rust is used for systems programming"])).unwrap();
    let stats = idx.stats();
    assert_eq!(stats.count, 1);
    assert_eq!(stats.backend, "lancedb");
}

proptest! {
    #[test]
    fn results_sorted_and_bounded(
        texts in prop::collection::vec("[a-e]{1,3}( [a-e]{1,3}){0,5}", 1..30),
        query in "[a-e]{1,3}( [a-e]{1,3}){0,3}",
        k in 1usize..40,
    ) {
        let idx = VectorIndex::in_memory(Box::new(FakeEmbedder::new(32)));
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        idx.index(&chunks(&refs)).unwrap();
        let hits = idx.search(&query, k).unwrap();

        prop_assert_eq!(hits.len(), k.min(texts.len()));
        for pair in hits.windows(2) {
            prop_assert!(pair[0].score >= pair[1].score);
            if pair[0].score == pair[1].score {
                prop_assert!(pair[0].metadata.position < pair[1].metadata.position);
            }
        }
        for h in &hits {
            prop_assert!((-1.0..=1.0).contains(&h.score));
        }
    }
}

#[test]
fn unnormalized_embedder_ranks_by_cosine() {
    let idx = VectorIndex::in_memory(Box::new(Scaled(FakeEmbedder::new(384))));
    idx.index(&languages()).unwrap();
    assert_eq!(idx.stats().metric, Metric::Cosine);

    let hits = idx.search("programming language for data analysis", 2).unwrap();
    assert!(hits[0].metadata.text.contains("Python"), "top hit: {}", hits[0].metadata.text);
    // magnitude does not leak into the score
    assert!((hits[0].score - 0.3651).abs() < 1e-3, "score {}", hits[0].score);
    assert!(hits.iter().all(|h| (-1.0..=1.0).contains(&h.score)));
}

#[test]
fn query_of_wrong_width_is_dimension_mismatch() {
    let idx = VectorIndex::in_memory(Box::new(QueryWidth));
    idx.index(&chunks(&["a", "b"])).unwrap();
    let err = idx.search("wide query", 1).unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { expected: 4, actual: 5 }), "{err:?}");
    assert_eq!(idx.stats().count, 2);
    assert_eq!(idx.search("narrow query", 1).unwrap().len(), 1);
}
