//! SQLite-backed [`Store`] implementation.
//!
//! Documents and chunks live in ordinary tables, keyword search goes through
//! an FTS5 virtual table, and embeddings are stored as little-endian f32
//! BLOBs scored with exact cosine similarity in Rust.
//!
//! The caller's [`AccessFilter`] is rendered into every query's WHERE clause
//! over the denormalized access columns (`owner_id`, `is_public`,
//! `shared_with`, `group_ids`), using `json_each` for the JSON array columns.
//! Row-level security is therefore enforced by the query itself; nothing is
//! filtered after the fetch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::access::{apply_sharing, AccessFilter, SharingGrant};
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::{AccessControl, Caller, Chunk, ChunkMetadata, Document, DocumentExtra};

use super::{ChunkHit, FieldFilter, Store};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Fetch a raw document row without access filtering (internal use for
    /// owner checks on mutations).
    async fn fetch_document(&self, id: &str) -> Result<Document> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| document_from_row(&r))
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("document {id}")))
    }
}

/// Render an access filter as a SQL predicate over the access columns of
/// `alias`, returning the clause and its bind values in order.
fn access_sql(filter: &AccessFilter, alias: &str) -> (String, Vec<String>) {
    match filter {
        AccessFilter::All => ("1=1".to_string(), Vec::new()),
        AccessFilter::Caller { id, label, groups } => {
            let mut clauses = vec![
                format!("{alias}.owner_id = ?"),
                format!("{alias}.is_public = 1"),
                format!(
                    "EXISTS (SELECT 1 FROM json_each({alias}.shared_with) \
                     WHERE json_each.value = ? OR json_each.value = ?)"
                ),
            ];
            let mut binds = vec![id.clone(), id.clone(), label.clone()];

            if !groups.is_empty() {
                let placeholders = vec!["?"; groups.len()].join(", ");
                clauses.push(format!(
                    "EXISTS (SELECT 1 FROM json_each({alias}.group_ids) \
                     WHERE json_each.value IN ({placeholders}))"
                ));
                binds.extend(groups.iter().cloned());
            }

            (format!("({})", clauses.join(" OR ")), binds)
        }
    }
}

/// Render a caller field filter as a SQL predicate, returning the clause
/// and `(json_path, value)` bind pairs in order.
fn field_filter_sql(filter: &FieldFilter, alias: &str) -> (String, Vec<(String, String)>) {
    if filter.is_empty() {
        return ("1=1".to_string(), Vec::new());
    }
    let mut clauses = Vec::new();
    let mut binds = Vec::new();
    for (key, value) in &filter.entries {
        let key = key.strip_prefix("metadata.").unwrap_or(key);
        let path = if key == "source" {
            "$.source".to_string()
        } else {
            format!("$.extra.{key}")
        };
        clauses.push(format!("json_extract({alias}.metadata_json, ?) = ?"));
        binds.push((path, value.clone()));
    }
    (clauses.join(" AND "), binds)
}

fn access_from_row(row: &SqliteRow) -> Result<AccessControl> {
    let shared_with: String = row.get("shared_with");
    let group_ids: String = row.get("group_ids");
    Ok(AccessControl {
        owner_id: row.get("owner_id"),
        owner_label: row.get("owner_label"),
        is_public: row.get::<i64, _>("is_public") != 0,
        shared_with: serde_json::from_str(&shared_with).unwrap_or_default(),
        group_ids: serde_json::from_str(&group_ids).unwrap_or_default(),
    })
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let metadata_json: String = row.get("metadata_json");
    Ok(Document {
        id: row.get("id"),
        title: row.get("title"),
        source: row.get("source"),
        content: row.get("content"),
        metadata: serde_json::from_str::<DocumentExtra>(&metadata_json).unwrap_or_default(),
        access: access_from_row(row)?,
        created_at: ts_to_datetime(row.get("created_at")),
        updated_at: ts_to_datetime(row.get("updated_at")),
    })
}

fn chunk_metadata_from_row(row: &SqliteRow) -> ChunkMetadata {
    let metadata_json: String = row.get("metadata_json");
    serde_json::from_str(&metadata_json).unwrap_or_default()
}

fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}

fn access_json(access: &AccessControl) -> (String, String) {
    (
        serde_json::to_string(&access.shared_with).unwrap_or_else(|_| "[]".to_string()),
        serde_json::to_string(&access.group_ids).unwrap_or_else(|_| "[]".to_string()),
    )
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_document(&self, doc: &Document) -> Result<String> {
        let metadata_json =
            serde_json::to_string(&doc.metadata).unwrap_or_else(|_| "{}".to_string());
        let (shared_with, group_ids) = access_json(&doc.access);

        sqlx::query(
            r#"
            INSERT INTO documents (id, title, source, content, metadata_json,
                                   owner_id, owner_label, is_public, shared_with, group_ids,
                                   created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                source = excluded.source,
                content = excluded.content,
                metadata_json = excluded.metadata_json,
                owner_id = excluded.owner_id,
                owner_label = excluded.owner_label,
                is_public = excluded.is_public,
                shared_with = excluded.shared_with,
                group_ids = excluded.group_ids,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.title)
        .bind(&doc.source)
        .bind(&doc.content)
        .bind(&metadata_json)
        .bind(&doc.access.owner_id)
        .bind(&doc.access.owner_label)
        .bind(doc.access.is_public as i64)
        .bind(&shared_with)
        .bind(&group_ids)
        .bind(doc.created_at.timestamp())
        .bind(doc.updated_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(doc.id.clone())
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM chunk_vectors WHERE chunk_id IN \
             (SELECT id FROM chunks WHERE document_id = ?)",
        )
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        let now = Utc::now().timestamp();
        for chunk in chunks {
            let metadata_json =
                serde_json::to_string(&chunk.metadata).unwrap_or_else(|_| "{}".to_string());
            let (shared_with, group_ids) = access_json(&chunk.access);

            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, content, start_char, end_char,
                                    metadata_json, content_hash,
                                    owner_id, owner_label, is_public, shared_with, group_ids)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .bind(chunk.start_char as i64)
            .bind(chunk.end_char as i64)
            .bind(&metadata_json)
            .bind(&chunk.content_hash)
            .bind(&chunk.access.owner_id)
            .bind(&chunk.access.owner_label)
            .bind(chunk.access.is_public as i64)
            .bind(&shared_with)
            .bind(&group_ids)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, content) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.document_id)
                .bind(&chunk.content)
                .execute(&mut *tx)
                .await?;

            if let Some(embedding) = &chunk.embedding {
                sqlx::query(
                    r#"
                    INSERT INTO chunk_vectors (chunk_id, document_id, embedding, model, dims, created_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT(chunk_id) DO UPDATE SET
                        document_id = excluded.document_id,
                        embedding = excluded.embedding,
                        model = excluded.model,
                        dims = excluded.dims,
                        created_at = excluded.created_at
                    "#,
                )
                .bind(&chunk.id)
                .bind(&chunk.document_id)
                .bind(vec_to_blob(embedding))
                .bind(chunk.metadata.embedding_model.as_deref().unwrap_or(""))
                .bind(embedding.len() as i64)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_document(&self, id: &str, access: &AccessFilter) -> Result<Document> {
        let (access_clause, access_binds) = access_sql(access, "d");
        let sql = format!("SELECT * FROM documents d WHERE d.id = ? AND {access_clause}");

        let mut query = sqlx::query(&sql).bind(id);
        for bind in &access_binds {
            query = query.bind(bind);
        }

        let row = query.fetch_optional(&self.pool).await?;
        row.map(|r| document_from_row(&r))
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("document {id}")))
    }

    async fn update_sharing(
        &self,
        id: &str,
        grant: &SharingGrant,
        caller: &Caller,
    ) -> Result<Document> {
        let access = AccessFilter::for_caller(caller);
        let doc = self.fetch_document(id).await?;
        if !access.matches(&doc.access) {
            return Err(Error::NotFound(format!("document {id}")));
        }
        if !caller.is_admin && doc.access.owner_id != caller.id {
            return Err(Error::validation("only the owner or an admin can modify sharing"));
        }

        let updated_access = apply_sharing(&doc.access, grant);
        let (shared_with, group_ids) = access_json(&updated_access);
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE documents SET is_public = ?, shared_with = ?, group_ids = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(updated_access.is_public as i64)
        .bind(&shared_with)
        .bind(&group_ids)
        .bind(now.timestamp())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        // The denormalized chunk copies must stay consistent with the
        // document, in the same transaction.
        sqlx::query(
            "UPDATE chunks SET is_public = ?, shared_with = ?, group_ids = ? \
             WHERE document_id = ?",
        )
        .bind(updated_access.is_public as i64)
        .bind(&shared_with)
        .bind(&group_ids)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Document {
            access: updated_access,
            updated_at: now,
            ..doc
        })
    }

    async fn delete_document(&self, id: &str, caller: &Caller) -> Result<()> {
        let access = AccessFilter::for_caller(caller);
        let doc = self.fetch_document(id).await?;
        if !access.matches(&doc.access) {
            return Err(Error::NotFound(format!("document {id}")));
        }
        if !caller.is_admin && doc.access.owner_id != caller.id {
            return Err(Error::validation("only the owner or an admin can delete"));
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM chunk_vectors WHERE chunk_id IN \
             (SELECT id FROM chunks WHERE document_id = ?)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
        access: &AccessFilter,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<ChunkHit>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let (access_clause, access_binds) = access_sql(access, "c");
        let empty = FieldFilter::default();
        let (filter_clause, filter_binds) = field_filter_sql(filter.unwrap_or(&empty), "c");

        let sql = format!(
            r#"
            SELECT chunks_fts.chunk_id AS chunk_id,
                   chunks_fts.document_id AS document_id,
                   c.content AS content,
                   c.metadata_json AS metadata_json,
                   chunks_fts.rank AS rank
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.chunk_id
            WHERE chunks_fts MATCH ? AND {access_clause} AND {filter_clause}
            ORDER BY rank
            LIMIT ?
            "#
        );

        let mut q = sqlx::query(&sql).bind(query);
        for bind in &access_binds {
            q = q.bind(bind);
        }
        for (path, value) in &filter_binds {
            q = q.bind(path).bind(value);
        }
        q = q.bind(limit as i64);

        let rows = q.fetch_all(&self.pool).await?;

        let hits = rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                ChunkHit {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    content: row.get("content"),
                    // Negate BM25 rank so higher is better.
                    raw_score: -rank,
                    metadata: chunk_metadata_from_row(row),
                }
            })
            .collect();

        Ok(hits)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        access: &AccessFilter,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<ChunkHit>> {
        let (access_clause, access_binds) = access_sql(access, "c");
        let empty = FieldFilter::default();
        let (filter_clause, filter_binds) = field_filter_sql(filter.unwrap_or(&empty), "c");

        let sql = format!(
            r#"
            SELECT v.chunk_id AS chunk_id,
                   v.document_id AS document_id,
                   v.embedding AS embedding,
                   c.content AS content,
                   c.metadata_json AS metadata_json
            FROM chunk_vectors v
            JOIN chunks c ON c.id = v.chunk_id
            WHERE {access_clause} AND {filter_clause}
            "#
        );

        let mut q = sqlx::query(&sql);
        for bind in &access_binds {
            q = q.bind(bind);
        }
        for (path, value) in &filter_binds {
            q = q.bind(path).bind(value);
        }

        let rows = q.fetch_all(&self.pool).await?;

        let mut hits: Vec<ChunkHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vector = blob_to_vec(&blob);
                ChunkHit {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    content: row.get("content"),
                    raw_score: cosine_similarity(query_vec, &vector) as f64,
                    metadata: chunk_metadata_from_row(row),
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(limit);

        Ok(hits)
    }
}
