//! In-memory [`Store`] implementation for tests.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock` for thread safety.
//! Vector search is brute-force cosine similarity over all stored vectors;
//! keyword search is case-insensitive term matching scored by match count.
//! Both apply the caller's access predicate pointwise, exactly as the SQL
//! backend applies it in-query.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::access::{apply_sharing, AccessFilter, SharingGrant};
use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::models::{Caller, Chunk, Document};

use super::{ChunkHit, FieldFilter, Store};

/// In-memory store for unit and integration tests.
#[derive(Default)]
pub struct InMemoryStore {
    docs: RwLock<HashMap<String, Document>>,
    chunks: RwLock<Vec<Chunk>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn visible_chunks<'a>(
        chunks: &'a [Chunk],
        access: &AccessFilter,
        filter: Option<&FieldFilter>,
    ) -> impl Iterator<Item = &'a Chunk> + 'a {
        let access = access.clone();
        let filter = filter.cloned();
        chunks.iter().filter(move |c| {
            access.matches(&c.access)
                && filter
                    .as_ref()
                    .map(|f| f.matches(&c.metadata))
                    .unwrap_or(true)
        })
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_document(&self, doc: &Document) -> Result<String> {
        let mut docs = self.docs.write().unwrap();
        docs.insert(doc.id.clone(), doc.clone());
        Ok(doc.id.clone())
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        {
            let docs = self.docs.read().unwrap();
            if !docs.contains_key(document_id) {
                return Err(Error::NotFound(format!("document {document_id}")));
            }
        }
        let mut stored = self.chunks.write().unwrap();
        stored.retain(|c| c.document_id != document_id);
        stored.extend(chunks.iter().cloned());
        Ok(())
    }

    async fn get_document(&self, id: &str, access: &AccessFilter) -> Result<Document> {
        let docs = self.docs.read().unwrap();
        docs.get(id)
            .filter(|d| access.matches(&d.access))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("document {id}")))
    }

    async fn update_sharing(
        &self,
        id: &str,
        grant: &SharingGrant,
        caller: &Caller,
    ) -> Result<Document> {
        let access = AccessFilter::for_caller(caller);
        let mut docs = self.docs.write().unwrap();
        let doc = docs
            .get_mut(id)
            .filter(|d| access.matches(&d.access))
            .ok_or_else(|| Error::NotFound(format!("document {id}")))?;

        if !caller.is_admin && doc.access.owner_id != caller.id {
            return Err(Error::validation("only the owner or an admin can modify sharing"));
        }

        doc.access = apply_sharing(&doc.access, grant);
        doc.updated_at = Utc::now();
        let updated = doc.clone();
        drop(docs);

        // Keep the denormalized copies consistent.
        let mut chunks = self.chunks.write().unwrap();
        for c in chunks.iter_mut().filter(|c| c.document_id == id) {
            c.access = updated.access.clone();
        }

        Ok(updated)
    }

    async fn delete_document(&self, id: &str, caller: &Caller) -> Result<()> {
        let access = AccessFilter::for_caller(caller);
        let mut docs = self.docs.write().unwrap();
        let doc = docs
            .get(id)
            .filter(|d| access.matches(&d.access))
            .ok_or_else(|| Error::NotFound(format!("document {id}")))?;

        if !caller.is_admin && doc.access.owner_id != caller.id {
            return Err(Error::validation("only the owner or an admin can delete"));
        }

        docs.remove(id);
        drop(docs);

        let mut chunks = self.chunks.write().unwrap();
        chunks.retain(|c| c.document_id != id);
        Ok(())
    }

    async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        access: &AccessFilter,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<ChunkHit>> {
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let chunks = self.chunks.read().unwrap();
        let mut candidates: Vec<ChunkHit> = Self::visible_chunks(&chunks, access, filter)
            .filter_map(|c| {
                let text_lower = c.content.to_lowercase();
                let matches = terms.iter().filter(|t| text_lower.contains(*t)).count();
                if matches > 0 {
                    Some(ChunkHit {
                        chunk_id: c.id.clone(),
                        document_id: c.document_id.clone(),
                        content: c.content.clone(),
                        raw_score: matches as f64,
                        metadata: c.metadata.clone(),
                    })
                } else {
                    None
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        access: &AccessFilter,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<ChunkHit>> {
        let chunks = self.chunks.read().unwrap();
        let mut candidates: Vec<ChunkHit> = Self::visible_chunks(&chunks, access, filter)
            .filter_map(|c| {
                let embedding = c.embedding.as_ref()?;
                Some(ChunkHit {
                    chunk_id: c.id.clone(),
                    document_id: c.document_id.clone(),
                    content: c.content.clone(),
                    raw_score: cosine_similarity(query_vec, embedding) as f64,
                    metadata: c.metadata.clone(),
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccessControl;
    use std::collections::BTreeMap;

    fn doc(id: &str, owner: &str) -> Document {
        Document {
            id: id.to_string(),
            title: "T".to_string(),
            source: "s".to_string(),
            content: "body".to_string(),
            metadata: Default::default(),
            access: AccessControl {
                owner_id: owner.to_string(),
                owner_label: format!("{owner}@example.com"),
                ..AccessControl::default()
            },
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn chunk_for(doc: &Document, id: &str, content: &str) -> Chunk {
        let mut chunks = crate::chunk::chunk_document(
            &doc.id,
            content,
            &doc.title,
            &doc.source,
            &BTreeMap::new(),
            &crate::config::ChunkingConfig::default(),
        );
        let mut c = chunks.remove(0);
        c.id = id.to_string();
        c.access = doc.access.clone();
        c.embedding = Some(vec![1.0, 0.0]);
        c
    }

    fn owner_caller(id: &str) -> Caller {
        Caller {
            id: id.to_string(),
            label: format!("{id}@example.com"),
            groups: vec![],
            is_admin: false,
        }
    }

    #[tokio::test]
    async fn test_chunks_require_parent_document() {
        let store = InMemoryStore::new();
        let d = doc("d1", "alice");
        let c = chunk_for(&d, "c1", "hello");
        let err = store.replace_chunks("d1", &[c]).await;
        assert!(matches!(err, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_keyword_search_honors_access() {
        let store = InMemoryStore::new();
        let d = doc("d1", "alice");
        store.upsert_document(&d).await.unwrap();
        store
            .replace_chunks("d1", &[chunk_for(&d, "c1", "private secret text")])
            .await
            .unwrap();

        let alice = AccessFilter::for_caller(&owner_caller("alice"));
        let bob = AccessFilter::for_caller(&owner_caller("bob"));

        let hits = store.keyword_search("secret", 10, &alice, None).await.unwrap();
        assert_eq!(hits.len(), 1);

        let hits = store.keyword_search("secret", 10, &bob, None).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_update_sharing_rewrites_chunk_copies() {
        let store = InMemoryStore::new();
        let d = doc("d1", "alice");
        store.upsert_document(&d).await.unwrap();
        store
            .replace_chunks("d1", &[chunk_for(&d, "c1", "shared text here")])
            .await
            .unwrap();

        let mut grant = SharingGrant::default();
        grant.shared_with.insert("bob".to_string());
        store
            .update_sharing("d1", &grant, &owner_caller("alice"))
            .await
            .unwrap();

        let bob = AccessFilter::for_caller(&owner_caller("bob"));
        let hits = store.keyword_search("shared", 10, &bob, None).await.unwrap();
        assert_eq!(hits.len(), 1, "chunk copy must reflect the new grant");
    }

    #[tokio::test]
    async fn test_non_owner_cannot_share_or_delete() {
        let store = InMemoryStore::new();
        let mut d = doc("d1", "alice");
        d.access.shared_with.insert("bob".to_string());
        store.upsert_document(&d).await.unwrap();

        let grant = SharingGrant {
            is_public: Some(true),
            ..SharingGrant::default()
        };
        let err = store
            .update_sharing("d1", &grant, &owner_caller("bob"))
            .await;
        assert!(matches!(err, Err(Error::Validation(_))));

        let err = store.delete_document("d1", &owner_caller("bob")).await;
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_delete_removes_chunks() {
        let store = InMemoryStore::new();
        let d = doc("d1", "alice");
        store.upsert_document(&d).await.unwrap();
        store
            .replace_chunks("d1", &[chunk_for(&d, "c1", "deletable text")])
            .await
            .unwrap();

        store
            .delete_document("d1", &owner_caller("alice"))
            .await
            .unwrap();

        let alice = AccessFilter::for_caller(&owner_caller("alice"));
        let hits = store
            .keyword_search("deletable", 10, &alice, None)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
