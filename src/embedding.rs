//! Embedding provider abstraction, the chunk-embedding pipeline, and vector
//! utilities.
//!
//! [`Embedder`] is the seam between the engine and the external embedding
//! endpoint; production uses [`HttpEmbedder`] against an OpenAI-compatible
//! `POST {endpoint}/embeddings` API, tests use deterministic fakes.
//!
//! Also provides vector helpers shared by the store adapters:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`vec_to_blob`] — encode a `Vec<f32>` as little-endian bytes for BLOB storage
//! - [`blob_to_vec`] — decode a BLOB back into a `Vec<f32>`
//!
//! # Truncation
//!
//! Inputs longer than the model's token budget are truncated deterministically
//! to `max_tokens × 4` bytes (4 bytes ≈ 1 token) before the call. Truncation
//! is silent, not an error.
//!
//! # Batching
//!
//! [`embed_chunks`] processes fixed-size batches *sequentially* to bound
//! memory use and rate-limit pressure on the endpoint. No retries are
//! performed; a failed batch fails the pipeline call.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::chat::{ChatMessage, ChatProvider};
use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use crate::models::Chunk;

/// Approximate bytes-per-token ratio used for truncation.
const BYTES_PER_TOKEN: usize = 4;

/// Document budget handed to the contextualization prompt.
const CONTEXT_DOCUMENT_BUDGET: usize = 25_000;

/// An embedding backend.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts; one vector per input, order-preserved.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        if vectors.is_empty() {
            return Err(Error::upstream("empty embedding response"));
        }
        Ok(vectors.remove(0))
    }
}

/// [`Embedder`] backed by an OpenAI-compatible HTTP endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dims: usize,
    api_key: String,
    max_input_bytes: usize,
}

impl HttpEmbedder {
    /// Build the client from configuration. `max_tokens` is the model's
    /// input budget (from the chunking section); the API key is read from
    /// the environment variable named in `config.api_key_env`.
    pub fn new(config: &EmbeddingConfig, max_tokens: usize) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| Error::upstream(format!("{} not set", config.api_key_env)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dims: config.dims,
            api_key,
            max_input_bytes: max_tokens * BYTES_PER_TOKEN,
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let input: Vec<&str> = texts
            .iter()
            .map(|t| truncate_to_budget(t, self.max_input_bytes))
            .collect();

        let body = serde_json::json!({
            "model": self.model,
            "input": input,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.endpoint))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(Error::upstream(format!(
                "embedding endpoint returned {status}: {body_text}"
            )));
        }

        let json: serde_json::Value = response.json().await?;
        let vectors = parse_embedding_response(&json)?;
        if vectors.len() != texts.len() {
            return Err(Error::upstream(format!(
                "embedding endpoint returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

/// Truncate `text` to at most `budget` bytes on a UTF-8 char boundary.
fn truncate_to_budget(text: &str, budget: usize) -> &str {
    if text.len() <= budget {
        return text;
    }
    let mut end = budget;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Parse the embeddings API response: `data[].embedding`, input order.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::upstream("invalid embedding response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::upstream("invalid embedding response: missing embedding"))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }
    Ok(embeddings)
}

/// Embed every chunk, batch by batch, assigning vectors in order and
/// stamping embedding provenance onto each chunk's metadata.
///
/// Batches of `batch_size` run sequentially; `progress` is invoked with
/// `(batch_index, total_batches)` after each completed batch.
pub async fn embed_chunks(
    embedder: &dyn Embedder,
    mut chunks: Vec<Chunk>,
    batch_size: usize,
    mut progress: Option<&mut (dyn FnMut(usize, usize) + Send)>,
) -> Result<Vec<Chunk>> {
    if chunks.is_empty() {
        return Ok(chunks);
    }

    let batch_size = batch_size.max(1);
    let total_batches = chunks.len().div_ceil(batch_size);

    for (batch_index, batch) in chunks.chunks_mut(batch_size).enumerate() {
        let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
        let vectors = embedder.embed_batch(&texts).await?;

        let now = Utc::now();
        for (chunk, vector) in batch.iter_mut().zip(vectors.into_iter()) {
            chunk.embedding = Some(vector);
            chunk.metadata.embedding_model = Some(embedder.model_name().to_string());
            chunk.metadata.embedding_generated_at = Some(now);
        }

        if let Some(cb) = progress.as_mut() {
            cb(batch_index, total_batches);
        }
    }

    Ok(chunks)
}

/// Ask the chat endpoint for a short sentence situating `chunk_text` within
/// its document, and prepend it to the chunk text.
///
/// Returns `(text, was_contextualized)`. Any failure returns the original
/// text and `false`; contextualization is never fatal to ingestion.
pub async fn contextualize(
    chat: &dyn ChatProvider,
    full_document: &str,
    chunk_text: &str,
) -> (String, bool) {
    let document = truncate_to_budget(full_document, CONTEXT_DOCUMENT_BUDGET);

    let messages = [
        ChatMessage::system(
            "You situate document excerpts. Given a document and one excerpt from it, \
             reply with a single short sentence describing where the excerpt fits in \
             the overall document. Reply with the sentence only.",
        ),
        ChatMessage::user(format!(
            "<document>\n{document}\n</document>\n\n<excerpt>\n{chunk_text}\n</excerpt>"
        )),
    ];

    match chat.complete(&messages).await {
        Ok(context) if !context.trim().is_empty() => {
            (format!("{}\n\n{}", context.trim(), chunk_text), true)
        }
        Ok(_) => (chunk_text.to_string(), false),
        Err(e) => {
            tracing::warn!(error = %e, "contextualization failed, embedding plain chunk text");
            (chunk_text.to_string(), false)
        }
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
