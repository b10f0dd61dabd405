//! Idempotent schema creation.
//!
//! Access-control fields (owner, public flag, shared identities, groups) are
//! stored on `documents` and denormalized onto `chunks`, so search queries
//! filter without a join. `shared_with` and `group_ids` are JSON arrays
//! queried with `json_each`.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            source TEXT NOT NULL,
            content TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            owner_id TEXT NOT NULL,
            owner_label TEXT NOT NULL,
            is_public INTEGER NOT NULL DEFAULT 0,
            shared_with TEXT NOT NULL DEFAULT '[]',
            group_ids TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            content TEXT NOT NULL,
            start_char INTEGER NOT NULL,
            end_char INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            content_hash TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            owner_label TEXT NOT NULL,
            is_public INTEGER NOT NULL DEFAULT 0,
            shared_with TEXT NOT NULL DEFAULT '[]',
            group_ids TEXT NOT NULL DEFAULT '[]',
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            embedding BLOB NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so check first.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                document_id UNINDEXED,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
        .execute(pool)
        .await?;

    Ok(())
}
