//! Similarity scoring and deterministic top-k selection.

use std::cmp::Ordering;

use semsearch_core::error::{Error, Result};
use semsearch_core::types::{IndexedVector, Metric, SearchHit};

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn magnitude(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let m = magnitude(v);
    if m > 0.0 && m.is_finite() {
        for x in v.iter_mut() {
            *x /= m;
        }
    }
}

/// Cosine similarity clamped to `[-1, 1]`; `0.0` when either side has no direction.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let denom = magnitude(a) * magnitude(b);
    if denom == 0.0 || !denom.is_finite() {
        return 0.0;
    }
    let s = dot(a, b) / denom;
    if s.is_nan() { 0.0 } else { s.clamp(-1.0, 1.0) }
}

pub fn score(metric: Metric, query: &[f32], candidate: &[f32]) -> f32 {
    match metric {
        Metric::Cosine => cosine(query, candidate),
        Metric::Dot => {
            let s = dot(query, candidate);
            if s.is_nan() { 0.0 } else { s.clamp(-1.0, 1.0) }
        }
    }
}

/// Higher score first; equal scores fall back to ascending position.
fn rank_order(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.score.total_cmp(&a.score).then(a.metadata.position.cmp(&b.metadata.position))
}

/// Score every record against `query` and keep the best `k`.
///
/// Returns `min(k, records.len())` hits in non-increasing score order.
pub fn top_k(query: &[f32], records: &[IndexedVector], k: usize, metric: Metric) -> Result<Vec<SearchHit>> {
    let mut hits = Vec::with_capacity(records.len());
    for r in records {
        if r.vector.len() != query.len() {
            return Err(Error::DimensionMismatch { expected: query.len(), actual: r.vector.len() });
        }
        hits.push(SearchHit { metadata: r.metadata.clone(), score: score(metric, query, &r.vector) });
    }
    let k = k.min(hits.len());
    if k == 0 {
        return Ok(Vec::new());
    }
    if k < hits.len() {
        hits.select_nth_unstable_by(k - 1, rank_order);
        hits.truncate(k);
    }
    hits.sort_by(rank_order);
    Ok(hits)
}
