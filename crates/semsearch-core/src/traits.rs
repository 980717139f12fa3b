use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{IndexedVector, SearchHit, TokenId};

/// Text <-> token id codec consulted by the chunker.
pub trait TokenCodec: Send + Sync {
    /// Encode without adding special (BOS/EOS/CLS/SEP) tokens.
    fn encode(&self, text: &str) -> anyhow::Result<Vec<TokenId>>;
    /// Decode while skipping special tokens.
    fn decode(&self, ids: &[TokenId]) -> anyhow::Result<String>;
}

pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;
    fn max_len(&self) -> usize;
    /// `true` when every returned vector is already unit length.
    fn normalized(&self) -> bool {
        false
    }
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("embedder returned no vector"))
    }
}

/// Immutable, shareable view of one namespace's records in position order.
pub type Snapshot = Arc<[IndexedVector]>;

/// Storage behind the vector index.
///
/// `replace` must be atomic per namespace: readers observe either the previous
/// record set or the new one, never a mix. Other namespaces are untouched.
pub trait IndexStore: Send + Sync {
    fn name(&self) -> &'static str;
    fn replace(&self, namespace: &str, records: Vec<IndexedVector>) -> Result<()>;
    /// `None` when the namespace holds no records.
    fn snapshot(&self, namespace: &str) -> Result<Option<Snapshot>>;
    /// Clear one namespace, or everything when `namespace` is `None`.
    fn clear(&self, namespace: Option<&str>) -> Result<()>;
    fn namespaces(&self) -> Result<BTreeMap<String, usize>>;
}

pub trait SearchEngine: Send + Sync {
    /// Chunk and index `text` into `namespace`, returning the chunk count.
    fn index(&self, namespace: &str, text: &str) -> Result<usize>;
    fn query(&self, namespace: &str, query: &str, k: usize) -> Result<Vec<SearchHit>>;
}
