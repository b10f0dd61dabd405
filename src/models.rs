//! Core data models used throughout Quarry.
//!
//! These types represent the documents, chunks, and search results that flow
//! through the ingestion and retrieval pipeline. Well-known metadata fields
//! are explicit struct members; anything else lives in an open `extra` map.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The identity a request is executed as.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    /// Opaque caller id (matched against `owner_id` and `shared_with`).
    pub id: String,
    /// Human-readable identity, e.g. an email (also matched against `shared_with`).
    pub label: String,
    /// Groups the caller belongs to.
    pub groups: Vec<String>,
    /// Admins bypass row-level security entirely.
    pub is_admin: bool,
}

/// Access-control fields attached to a document and denormalized onto each
/// of its chunks at write time, so query-time filtering needs no join.
///
/// Sharing updates must rewrite the chunk copies; see
/// [`Store::update_sharing`](crate::store::Store::update_sharing).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessControl {
    pub owner_id: String,
    pub owner_label: String,
    pub is_public: bool,
    /// Identity strings (ids or labels) the document is shared with.
    pub shared_with: BTreeSet<String>,
    /// Groups the document is shared with.
    pub group_ids: BTreeSet<String>,
}

/// Open key/value bag attached to a document, with the well-known fields
/// pulled out explicitly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentExtra {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingested_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Normalized document stored in the backing store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    /// Origin identifier, e.g. a URL or connector name.
    pub source: String,
    /// Full normalized text.
    pub content: String,
    pub metadata: DocumentExtra,
    pub access: AccessControl,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Chunk-level metadata: a copy of the parent document's well-known fields
/// plus chunk-local embedding provenance, with an open `extra` map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_generated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ChunkMetadata {
    /// Display title for citations: `document_title`, then `title`, then
    /// `"Untitled"`.
    pub fn display_title(&self) -> String {
        self.document_title
            .clone()
            .or_else(|| self.title.clone())
            .unwrap_or_else(|| "Untitled".to_string())
    }

    /// Citation source, empty string when absent.
    pub fn display_source(&self) -> String {
        self.source.clone().unwrap_or_default()
    }
}

/// A bounded, embeddable slice of a document's text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// 0-based position within the document, unique per document.
    pub chunk_index: i64,
    pub content: String,
    /// Embedding vector; `None` until the embedding pipeline runs.
    pub embedding: Option<Vec<f32>>,
    /// Byte offset of the slice start in the source content (UTF-8 boundary).
    pub start_char: usize,
    /// Byte offset one past the slice end in the source content.
    pub end_char: usize,
    pub metadata: ChunkMetadata,
    /// Copy of the parent document's access fields, kept in sync on every
    /// sharing update.
    pub access: AccessControl,
    /// SHA-256 of `content`, for embedding staleness detection.
    pub content_hash: String,
}

/// A search result returned from the query engine. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    /// Normalized score. Vector scores are cosine similarity in `[0, 1]`;
    /// keyword-only scores are rank-based and normalized per result set.
    pub similarity: f64,
    pub metadata: ChunkMetadata,
}

/// A numbered reference to a chunk that backed an answer. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    /// 1-based position in the result list.
    pub id: usize,
    pub title: String,
    pub source: String,
    pub chunk_id: String,
}
