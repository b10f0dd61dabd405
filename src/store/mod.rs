//! Storage abstraction for Quarry.
//!
//! The [`Store`] trait defines all persistence and raw-search operations the
//! engine needs, enabling pluggable backends (SQLite, in-memory for tests).
//! Every read and search takes the caller's [`AccessFilter`] so row-level
//! security is enforced inside the backend query, composed (logical AND)
//! with the search predicate and any caller-supplied [`FieldFilter`].
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Write ordering
//!
//! A document's row is written before its chunks ([`Store::upsert_document`]
//! then [`Store::replace_chunks`]); chunks must never be readable before
//! their parent document exists. Deleting a document removes all of its
//! chunks. Sharing updates rewrite the denormalized access fields on every
//! child chunk.

pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::access::{AccessFilter, SharingGrant};
use crate::error::Result;
use crate::models::{Caller, Chunk, ChunkMetadata, Document};

/// A candidate chunk returned from a keyword or vector search leg.
///
/// Carries enough information to perform score normalization, hybrid merging,
/// and result construction without additional store round-trips.
#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    /// Raw score from the backend: cosine similarity for vector hits,
    /// negated BM25 rank for keyword hits (higher is better for both).
    pub raw_score: f64,
    pub metadata: ChunkMetadata,
}

/// Caller-supplied equality filter over chunk metadata, ANDed with the
/// access predicate and the search predicate.
///
/// Key `"source"` matches the well-known source field; any other key (with
/// an optional `"metadata."` prefix) matches a string value in the open
/// `extra` map.
#[derive(Debug, Clone, Default)]
pub struct FieldFilter {
    pub entries: BTreeMap<String, String>,
}

impl FieldFilter {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pointwise evaluation against a chunk's metadata.
    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        self.entries.iter().all(|(key, expected)| {
            let key = key.strip_prefix("metadata.").unwrap_or(key);
            if key == "source" {
                metadata.source.as_deref() == Some(expected.as_str())
            } else {
                metadata
                    .extra
                    .get(key)
                    .and_then(|v| v.as_str())
                    .map(|v| v == expected)
                    .unwrap_or(false)
            }
        })
    }
}

/// Abstract storage backend.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or update a document row. Returns the document id.
    async fn upsert_document(&self, doc: &Document) -> Result<String>;

    /// Replace all chunks for a document, including their vectors and
    /// keyword-index entries.
    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()>;

    /// Fetch a document visible to the caller.
    ///
    /// Absent and not-visible are both [`Error::NotFound`](crate::error::Error::NotFound).
    async fn get_document(&self, id: &str, access: &AccessFilter) -> Result<Document>;

    /// Merge a sharing grant into a document and all of its chunks.
    ///
    /// Only the owner or an admin may modify sharing. Returns the updated
    /// document.
    async fn update_sharing(
        &self,
        id: &str,
        grant: &SharingGrant,
        caller: &Caller,
    ) -> Result<Document>;

    /// Delete a document and all of its chunks. Owner or admin only.
    async fn delete_document(&self, id: &str, caller: &Caller) -> Result<()>;

    /// Full-text search leg: top `limit` candidates by relevance.
    async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        access: &AccessFilter,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<ChunkHit>>;

    /// Vector-similarity search leg: top `limit` candidates by cosine
    /// similarity against `query_vec`.
    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        access: &AccessFilter,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<ChunkHit>>;
}
