pub mod chunker;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use chunker::{chunk, token_windows, ChunkingConfig, TextChunker, TokenWindows};
pub use error::{CollaboratorKind, Error, ErrorClass, Result};
pub use traits::{Embedder, IndexStore, SearchEngine, Snapshot, TokenCodec};
pub use types::{
    Chunk, ChunkMetadata, ChunkResult, IndexStats, IndexedVector, Metric, SearchHit, SearchResponse, TokenId,
    TokenSpan,
};
