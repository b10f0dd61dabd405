//! Semantic, keyword, and hybrid search entry points.
//!
//! Every entry point composes the caller's access predicate with the search
//! predicate (and any caller field filter) by handing both to the store; no
//! result is filtered after the fetch.
//!
//! # Hybrid fusion
//!
//! The semantic and keyword legs run concurrently with the same match count.
//! Results merge by `chunk_id`; a chunk present in both keeps the higher of
//! its two scores. The merged list sorts by score descending, then by
//! `chunk_id` ascending so equal scores order deterministically, and is
//! truncated to `match_count`.
//!
//! # Fallback rules
//!
//! A failed leg never fails a hybrid search: the other leg's results are
//! returned; if both legs fail the result is empty and the errors are
//! logged. An `IndexNotReady` error from the store is an expected cold-start
//! condition and yields empty results from any entry point.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::access::AccessFilter;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::models::SearchResult;
use crate::store::{ChunkHit, FieldFilter, Store};

/// Smallest and largest permitted `match_count`.
pub const MATCH_COUNT_RANGE: std::ops::RangeInclusive<usize> = 1..=50;

/// Which retrieval strategy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Semantic,
    Text,
    Hybrid,
}

impl FromStr for SearchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "semantic" => Ok(SearchMode::Semantic),
            "text" => Ok(SearchMode::Text),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(Error::validation(format!(
                "unknown search type: '{other}' (use semantic, text, or hybrid)"
            ))),
        }
    }
}

/// Search facade over a [`Store`] and an [`Embedder`].
///
/// Cheap to clone; both collaborators are shared and safe for concurrent use.
#[derive(Clone)]
pub struct SearchEngine {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    /// Candidate multiplier for the vector leg, compensating for
    /// approximate-index recall before the exact re-rank.
    overfetch_factor: usize,
}

impl SearchEngine {
    pub fn new(store: Arc<dyn Store>, embedder: Arc<dyn Embedder>, overfetch_factor: usize) -> Self {
        Self {
            store,
            embedder,
            overfetch_factor: overfetch_factor.max(1),
        }
    }

    /// Dispatch on `mode`.
    pub async fn search(
        &self,
        mode: SearchMode,
        query: &str,
        match_count: usize,
        access: &AccessFilter,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<SearchResult>> {
        match mode {
            SearchMode::Semantic => self.semantic_search(query, match_count, access, filter).await,
            SearchMode::Text => self.text_search(query, match_count, access, filter).await,
            SearchMode::Hybrid => self.hybrid_search(query, match_count, access, filter).await,
        }
    }

    /// Vector-similarity search: embed the query, over-fetch candidates,
    /// return the top `match_count` by similarity descending.
    pub async fn semantic_search(
        &self,
        query: &str,
        match_count: usize,
        access: &AccessFilter,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<SearchResult>> {
        validate_query(query, match_count)?;
        self.semantic_leg(query, match_count, access, filter).await
    }

    /// Full-text relevance search, top `match_count` descending.
    pub async fn text_search(
        &self,
        query: &str,
        match_count: usize,
        access: &AccessFilter,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<SearchResult>> {
        validate_query(query, match_count)?;
        self.text_leg(query, match_count, access, filter).await
    }

    /// Fused search: both legs concurrently, merged and deduplicated.
    pub async fn hybrid_search(
        &self,
        query: &str,
        match_count: usize,
        access: &AccessFilter,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<SearchResult>> {
        validate_query(query, match_count)?;

        let (semantic, text) = tokio::join!(
            self.semantic_leg(query, match_count, access, filter),
            self.text_leg(query, match_count, access, filter),
        );

        let (semantic, text) = match (semantic, text) {
            (Ok(s), Ok(t)) => (s, t),
            (Ok(s), Err(e)) => {
                tracing::warn!(query, error = %e, "text leg failed, using semantic results only");
                (s, Vec::new())
            }
            (Err(e), Ok(t)) => {
                tracing::warn!(query, error = %e, "semantic leg failed, using text results only");
                (Vec::new(), t)
            }
            (Err(se), Err(te)) => {
                tracing::warn!(
                    query,
                    semantic_error = %se,
                    text_error = %te,
                    "both hybrid legs failed, returning empty results"
                );
                return Ok(Vec::new());
            }
        };

        let mut merged: HashMap<String, SearchResult> = HashMap::new();
        for result in semantic.into_iter().chain(text) {
            match merged.get_mut(&result.chunk_id) {
                Some(existing) => {
                    if result.similarity > existing.similarity {
                        *existing = result;
                    }
                }
                None => {
                    merged.insert(result.chunk_id.clone(), result);
                }
            }
        }

        let mut results: Vec<SearchResult> = merged.into_values().collect();
        sort_results(&mut results);
        results.truncate(match_count);
        Ok(results)
    }

    async fn semantic_leg(
        &self,
        query: &str,
        match_count: usize,
        access: &AccessFilter,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<SearchResult>> {
        let query_vec = self.embedder.embed(query).await?;

        let candidate_k = match_count.saturating_mul(self.overfetch_factor);
        let hits = match self
            .store
            .vector_search(&query_vec, candidate_k, access, filter)
            .await
        {
            Ok(hits) => hits,
            Err(e) if e.is_index_not_ready() => {
                tracing::debug!(query, error = %e, "vector index not ready, returning empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut results: Vec<SearchResult> = hits
            .into_iter()
            .map(|hit| to_result(hit, |raw| raw.clamp(0.0, 1.0)))
            .collect();
        sort_results(&mut results);
        results.truncate(match_count);
        Ok(results)
    }

    async fn text_leg(
        &self,
        query: &str,
        match_count: usize,
        access: &AccessFilter,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<SearchResult>> {
        let hits = match self
            .store
            .keyword_search(query, match_count, access, filter)
            .await
        {
            Ok(hits) => hits,
            Err(e) if e.is_index_not_ready() => {
                tracing::debug!(query, error = %e, "keyword index not ready, returning empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let normalized = normalize_scores(&hits);
        let mut results: Vec<SearchResult> = hits
            .iter()
            .zip(normalized)
            .map(|(hit, score)| to_result(hit.clone(), |_| score))
            .collect();
        sort_results(&mut results);
        results.truncate(match_count);
        Ok(results)
    }
}

fn validate_query(query: &str, match_count: usize) -> Result<()> {
    if query.trim().is_empty() {
        return Err(Error::validation("query must not be empty"));
    }
    if !MATCH_COUNT_RANGE.contains(&match_count) {
        return Err(Error::validation(format!(
            "match_count must be in {}..={}",
            MATCH_COUNT_RANGE.start(),
            MATCH_COUNT_RANGE.end()
        )));
    }
    Ok(())
}

fn to_result(hit: ChunkHit, score: impl Fn(f64) -> f64) -> SearchResult {
    SearchResult {
        similarity: score(hit.raw_score),
        chunk_id: hit.chunk_id,
        document_id: hit.document_id,
        content: hit.content,
        metadata: hit.metadata,
    }
}

/// Score descending, then `chunk_id` ascending for deterministic ties.
fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they normalize to `1.0`.
fn normalize_scores(hits: &[ChunkHit]) -> Vec<f64> {
    if hits.is_empty() {
        return Vec::new();
    }

    let s_min = hits.iter().map(|h| h.raw_score).fold(f64::INFINITY, f64::min);
    let s_max = hits
        .iter()
        .map(|h| h.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    hits.iter()
        .map(|h| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (h.raw_score - s_min) / (s_max - s_min)
            }
        })
        .collect()
}
