//! Ingestion pipeline orchestration.
//!
//! Coordinates the flow for one document: validation → normalization →
//! chunking → optional contextualization → embedding → storage. The document
//! row is always written before its chunks, so a chunk is never readable
//! without its parent.
//!
//! Contextualization (when enabled) enriches the text that gets *embedded*;
//! the stored chunk content stays an exact slice of the document so offsets
//! remain valid. Chunks that were embedded with enriched text are marked in
//! their metadata.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::chat::ChatProvider;
use crate::chunk::chunk_document;
use crate::config::ChunkingConfig;
use crate::embedding::{contextualize, embed_chunks, Embedder};
use crate::error::{Error, Result};
use crate::models::{AccessControl, Document, DocumentExtra};
use crate::store::Store;

/// Everything needed to ingest one document.
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    pub content: String,
    pub title: String,
    pub source: String,
    pub source_type: Option<String>,
    pub tags: Vec<String>,
    pub extra: BTreeMap<String, serde_json::Value>,
    pub owner_id: String,
    pub owner_label: String,
    pub is_public: bool,
    pub shared_with: BTreeSet<String>,
    pub group_ids: BTreeSet<String>,
}

/// Summary of a completed ingestion.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub document_id: String,
    pub chunk_count: usize,
    /// Chunks whose embedded text was enriched with document context.
    pub contextualized: usize,
}

/// Ingestion pipeline over a store, an embedder, and (optionally) a chat
/// provider for contextualization.
pub struct Ingestor {
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    chat: Option<Arc<dyn ChatProvider>>,
    chunking: ChunkingConfig,
    batch_size: usize,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        chat: Option<Arc<dyn ChatProvider>>,
        chunking: ChunkingConfig,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            chat,
            chunking,
            batch_size,
        }
    }

    /// Ingest one document. `progress` is forwarded to the embedding
    /// pipeline as `(batch_index, total_batches)`.
    pub async fn ingest(
        &self,
        request: IngestRequest,
        progress: Option<&mut (dyn FnMut(usize, usize) + Send)>,
    ) -> Result<IngestReport> {
        validate(&request)?;

        let now = Utc::now();
        let document = Document {
            id: Uuid::new_v4().to_string(),
            title: request.title.clone(),
            source: request.source.clone(),
            content: request.content.clone(),
            metadata: DocumentExtra {
                source_type: request.source_type.clone(),
                tags: request.tags.clone(),
                ingested_at: Some(now),
                extra: request.extra.clone(),
            },
            access: AccessControl {
                owner_id: request.owner_id.clone(),
                owner_label: request.owner_label.clone(),
                is_public: request.is_public,
                shared_with: request.shared_with.clone(),
                group_ids: request.group_ids.clone(),
            },
            created_at: now,
            updated_at: now,
        };

        let mut chunks = chunk_document(
            &document.id,
            &document.content,
            &document.title,
            &document.source,
            &request.extra,
            &self.chunking,
        );
        for chunk in chunks.iter_mut() {
            chunk.access = document.access.clone();
        }

        // Build the texts to embed; the stored content is never rewritten.
        let mut contextualized = 0usize;
        let mut embed_input = chunks.clone();
        if let Some(chat) = &self.chat {
            for chunk in embed_input.iter_mut() {
                let (text, flagged) =
                    contextualize(chat.as_ref(), &document.content, &chunk.content).await;
                if flagged {
                    contextualized += 1;
                    chunk.content = text;
                }
            }
        }

        let embedded = embed_chunks(
            self.embedder.as_ref(),
            embed_input,
            self.batch_size,
            progress,
        )
        .await?;

        for (chunk, source) in chunks.iter_mut().zip(embedded.iter()) {
            chunk.embedding = source.embedding.clone();
            chunk.metadata.embedding_model = source.metadata.embedding_model.clone();
            chunk.metadata.embedding_generated_at = source.metadata.embedding_generated_at;
        }
        if contextualized > 0 {
            for (chunk, source) in chunks.iter_mut().zip(embedded.iter()) {
                if source.content != chunk.content {
                    chunk
                        .metadata
                        .extra
                        .insert("contextualized".to_string(), serde_json::json!(true));
                }
            }
        }

        // Document first, then chunks.
        self.store.upsert_document(&document).await?;
        self.store.replace_chunks(&document.id, &chunks).await?;

        tracing::info!(
            document_id = %document.id,
            chunks = chunks.len(),
            contextualized,
            "ingested document"
        );

        Ok(IngestReport {
            document_id: document.id,
            chunk_count: chunks.len(),
            contextualized,
        })
    }
}

fn validate(request: &IngestRequest) -> Result<()> {
    if request.content.trim().is_empty() {
        return Err(Error::validation("content must not be empty"));
    }
    if request.title.trim().is_empty() {
        return Err(Error::validation("title must not be empty"));
    }
    if request.source.trim().is_empty() {
        return Err(Error::validation("source must not be empty"));
    }
    if request.owner_id.trim().is_empty() {
        return Err(Error::validation("owner_id must not be empty"));
    }
    Ok(())
}
