//! Sliding-window chunking over a token stream.
//!
//! Windows hold at most `max_tokens` tokens and consecutive windows share
//! `overlap_tokens` tokens. The last window always ends exactly at the end of
//! the stream and is never followed by an empty one.

use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::traits::TokenCodec;
use crate::types::{Chunk, TokenId, TokenSpan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { max_tokens: 500, overlap_tokens: 50 }
    }
}

impl ChunkingConfig {
    pub fn new(max_tokens: usize, overlap_tokens: usize) -> Result<Self> {
        let config = Self { max_tokens, overlap_tokens };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(Error::InvalidConfig("max_tokens must be greater than 0".into()));
        }
        if self.overlap_tokens >= self.max_tokens {
            return Err(Error::InvalidConfig(format!(
                "overlap_tokens ({}) must be smaller than max_tokens ({})",
                self.overlap_tokens, self.max_tokens
            )));
        }
        Ok(())
    }

    /// Shrink the window to at most `limit` tokens, scaling the overlap by the
    /// same ratio. Unchanged when it already fits.
    pub fn fit_to(self, limit: usize) -> Result<Self> {
        self.validate()?;
        if self.max_tokens <= limit {
            return Ok(self);
        }
        let overlap_tokens = self.overlap_tokens * limit / self.max_tokens;
        debug!(from = self.max_tokens, to = limit, overlap_tokens, "capping chunk size to embedder input limit");
        Self::new(limit, overlap_tokens)
    }

    /// Number of windows produced for a stream of `total` tokens.
    pub fn expected_chunks(&self, total: usize) -> usize {
        if total == 0 {
            0
        } else if total <= self.max_tokens {
            1
        } else {
            let step = self.max_tokens - self.overlap_tokens;
            (total - self.overlap_tokens).div_ceil(step)
        }
    }
}

/// Iterator over the half-open token ranges of each window.
#[derive(Debug, Clone)]
pub struct TokenWindows {
    total: usize,
    config: ChunkingConfig,
    next_start: Option<usize>,
}

impl TokenWindows {
    /// `config` must already be validated; an unvalidated overlap would stall.
    fn new(total: usize, config: ChunkingConfig) -> Self {
        Self { total, config, next_start: (total > 0).then_some(0) }
    }
}

impl Iterator for TokenWindows {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.next_start?;
        let end = (start + self.config.max_tokens).min(self.total);
        self.next_start = (end < self.total).then(|| end - self.config.overlap_tokens);
        Some(start..end)
    }
}

pub fn token_windows(total: usize, config: ChunkingConfig) -> Result<TokenWindows> {
    config.validate()?;
    Ok(TokenWindows::new(total, config))
}

pub struct TextChunker {
    codec: Arc<dyn TokenCodec>,
    config: ChunkingConfig,
}

impl std::fmt::Debug for TextChunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextChunker").field("config", &self.config).finish_non_exhaustive()
    }
}

impl TextChunker {
    /// Fails with `InvalidConfig` here, not on first use.
    pub fn new(codec: Arc<dyn TokenCodec>, config: ChunkingConfig) -> Result<Self> {
        config.validate()?;
        info!(max_tokens = config.max_tokens, overlap_tokens = config.overlap_tokens, "initialized text chunker");
        Ok(Self { codec, config })
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    pub fn chunk_text(&self, text: &str) -> Result<Vec<Chunk>> {
        let tokens = self.codec.encode(text).map_err(Error::tokenizer)?;
        info!(total_tokens = tokens.len(), "tokenized text");
        let mut chunks = self.chunk_tokens(&tokens)?;
        self.locate_chars(text, &tokens, &mut chunks)?;
        info!(chunks = chunks.len(), "created chunks");
        Ok(chunks)
    }

    /// Chunk an already tokenized stream. Character offsets are left unset.
    pub fn chunk_tokens(&self, tokens: &[TokenId]) -> Result<Vec<Chunk>> {
        TokenWindows::new(tokens.len(), self.config)
            .enumerate()
            .map(|(index, range)| {
                let text = self.codec.decode(&tokens[range.clone()]).map_err(Error::tokenizer)?;
                Ok(Chunk::from_span(index, TokenSpan::new(range, text)))
            })
            .collect()
    }

    // The search for chunk i+1 starts where the decoded non-overlapping
    // prefix of chunk i ends, so repeated passages resolve to the right place.
    // Matches are byte positions; they only move forward, so the char index is
    // carried along incrementally.
    fn locate_chars(&self, text: &str, tokens: &[TokenId], chunks: &mut [Chunk]) -> Result<()> {
        let mut cursor = 0usize;
        let mut prev: Option<(usize, usize)> = None; // (start_token, byte_start)
        let mut counted = (0usize, 0usize); // (byte, char) of the last match
        for chunk in chunks.iter_mut() {
            if let Some((prev_token, prev_byte)) = prev {
                let step = self.codec.decode(&tokens[prev_token..chunk.start_token]).map_err(Error::tokenizer)?;
                cursor = cursor.max(prev_byte + step.trim_end().len());
            }
            let needle = chunk.text.trim();
            match find_from(text, needle, cursor) {
                Some(pos) if !needle.is_empty() => {
                    let start = counted.1 + text[counted.0..pos].chars().count();
                    counted = (pos, start);
                    chunk.char_start = Some(start);
                    chunk.char_end = Some(start + needle.chars().count());
                    prev = Some((chunk.start_token, pos));
                    cursor = pos;
                }
                _ => {
                    debug!(chunk = chunk.index, "chunk text not found verbatim in source");
                    prev = None;
                }
            }
        }
        Ok(())
    }
}

fn find_from(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let from = (from..=haystack.len()).find(|&i| haystack.is_char_boundary(i))?;
    haystack[from..].find(needle).map(|p| from + p)
}

/// One-shot form of [`TextChunker::chunk_text`].
pub fn chunk(codec: Arc<dyn TokenCodec>, text: &str, max_tokens: usize, overlap_tokens: usize) -> Result<Vec<Chunk>> {
    TextChunker::new(codec, ChunkingConfig::new(max_tokens, overlap_tokens)?)?.chunk_text(text)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Whitespace codec interning each distinct word as one token id.
    #[derive(Default)]
    pub(crate) struct WordCodec {
        vocab: Mutex<Vec<String>>,
    }

    impl TokenCodec for WordCodec {
        fn encode(&self, text: &str) -> anyhow::Result<Vec<TokenId>> {
            let mut vocab = self.vocab.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
            Ok(text
                .split_whitespace()
                .map(|w| match vocab.iter().position(|v| v == w) {
                    Some(i) => i as TokenId,
                    None => {
                        vocab.push(w.to_string());
                        (vocab.len() - 1) as TokenId
                    }
                })
                .collect())
        }

        fn decode(&self, ids: &[TokenId]) -> anyhow::Result<String> {
            let vocab = self.vocab.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
            let words: Vec<&str> = ids.iter().map(|&i| vocab[i as usize].as_str()).collect();
            Ok(words.join(" "))
        }
    }

    fn chunker(max: usize, overlap: usize) -> TextChunker {
        TextChunker::new(Arc::new(WordCodec::default()), ChunkingConfig::new(max, overlap).unwrap()).unwrap()
    }

    #[test]
    fn windows_step_by_max_minus_overlap() {
        let w: Vec<_> = token_windows(20, ChunkingConfig::new(10, 2).unwrap()).unwrap().collect();
        assert_eq!(w, vec![0..10, 8..18, 16..20]);
    }

    #[test]
    fn windows_without_overlap_are_contiguous() {
        let w: Vec<_> = token_windows(25, ChunkingConfig::new(10, 0).unwrap()).unwrap().collect();
        assert_eq!(w, vec![0..10, 10..20, 20..25]);
    }

    #[test]
    fn exact_multiple_has_no_trailing_window() {
        let w: Vec<_> = token_windows(18, ChunkingConfig::new(10, 2).unwrap()).unwrap().collect();
        assert_eq!(w, vec![0..10, 8..18]);
    }

    #[test]
    fn empty_stream_yields_nothing() {
        assert_eq!(token_windows(0, ChunkingConfig::default()).unwrap().count(), 0);
        assert!(chunker(10, 2).chunk_text("   ").unwrap().is_empty());
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunker(10, 2).chunk_text("only three words").unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "only three words");
        assert_eq!((chunks[0].start_token, chunks[0].end_token, chunks[0].token_count), (0, 3, 3));
        assert_eq!((chunks[0].char_start, chunks[0].char_end), (Some(0), Some(16)));
    }

    #[test]
    fn overlap_not_below_max_is_rejected() {
        assert!(matches!(ChunkingConfig::new(5, 10), Err(Error::InvalidConfig(_))));
        assert!(matches!(ChunkingConfig::new(5, 5), Err(Error::InvalidConfig(_))));
        assert!(matches!(ChunkingConfig::new(0, 0), Err(Error::InvalidConfig(_))));
        let bad = ChunkingConfig { max_tokens: 5, overlap_tokens: 10 };
        assert!(matches!(TextChunker::new(Arc::new(WordCodec::default()), bad), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn char_offsets_follow_repeated_text() {
        let text = "word ".repeat(30);
        let chunks = chunker(10, 2).chunk_text(&text).unwrap();
        // token t starts at char 5 * t
        for c in &chunks {
            assert_eq!(c.char_start, Some(c.start_token * 5), "chunk {}", c.index);
            assert_eq!(c.char_end, Some(c.end_token * 5 - 1));
        }
    }

    #[test]
    fn char_offsets_count_chars_not_bytes() {
        let text = "héllo wörld ünïcode text here";
        let chunks = chunker(2, 0).chunk_text(text).unwrap();
        let spans: Vec<_> = chunks.iter().map(|c| (c.char_start, c.char_end)).collect();
        assert_eq!(spans, vec![(Some(0), Some(11)), (Some(12), Some(24)), (Some(25), Some(29))]);
        let chars: Vec<char> = text.chars().collect();
        let second: String = chars[12..24].iter().collect();
        assert_eq!(second, chunks[1].text);
    }

    #[test]
    fn fit_to_caps_window_and_scales_overlap() {
        let base = ChunkingConfig::new(500, 50).unwrap();
        assert_eq!(base.fit_to(1000).unwrap(), base);
        assert_eq!(base.fit_to(256).unwrap(), ChunkingConfig { max_tokens: 256, overlap_tokens: 25 });
        assert_eq!(ChunkingConfig::new(10, 9).unwrap().fit_to(1).unwrap(), ChunkingConfig { max_tokens: 1, overlap_tokens: 0 });
        assert!(matches!(base.fit_to(0), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn unmatched_text_leaves_offsets_unset() {
        struct Upper(WordCodec);
        impl TokenCodec for Upper {
            fn encode(&self, text: &str) -> anyhow::Result<Vec<TokenId>> {
                self.0.encode(text)
            }
            fn decode(&self, ids: &[TokenId]) -> anyhow::Result<String> {
                Ok(self.0.decode(ids)?.to_uppercase())
            }
        }
        let c = TextChunker::new(Arc::new(Upper(WordCodec::default())), ChunkingConfig::new(4, 1).unwrap()).unwrap();
        let chunks = c.chunk_text("one two three four five six").unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.char_start.is_none() && c.char_end.is_none()));
    }

    #[test]
    fn tokenizer_failure_is_collaborator_error() {
        struct Broken;
        impl TokenCodec for Broken {
            fn encode(&self, _: &str) -> anyhow::Result<Vec<TokenId>> {
                anyhow::bail!("vocab missing")
            }
            fn decode(&self, _: &[TokenId]) -> anyhow::Result<String> {
                Ok(String::new())
            }
        }
        let c = TextChunker::new(Arc::new(Broken), ChunkingConfig::default()).unwrap();
        let err = c.chunk_text("hello").unwrap_err();
        assert!(matches!(err, Error::Collaborator { kind: crate::error::CollaboratorKind::Tokenizer, .. }));
    }
}
