use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Target window size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Overlap carried back from the previous window, in bytes.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// Hard per-chunk ceiling in bytes.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    /// Embedding-model token budget (4 bytes ≈ 1 token).
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            max_chunk_size: default_max_chunk_size(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_chunk_size() -> usize {
    1600
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_max_chunk_size() -> usize {
    2000
}
fn default_max_tokens() -> usize {
    8192
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// OpenAI-compatible API base, e.g. `https://api.openai.com/v1`.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Vector dimensionality, fixed per model.
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Chunks per embedding request; batches run sequentially.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// When true, chunks are prefixed with an LLM-written situating sentence
    /// before embedding. Failures fall back to the plain chunk text.
    #[serde(default)]
    pub contextualize: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_embedding_model(),
            dims: default_dims(),
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
            api_key_env: default_api_key_env(),
            contextualize: false,
        }
    }
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_batch_size() -> usize {
    100
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_chat_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_chat_model(),
            temperature: default_temperature(),
            max_tokens: default_chat_max_tokens(),
            timeout_secs: default_timeout_secs(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_temperature() -> f64 {
    0.0
}
fn default_chat_max_tokens() -> u32 {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// `"semantic"`, `"text"`, or `"hybrid"`.
    #[serde(default = "default_search_type")]
    pub search_type: String,
    #[serde(default = "default_match_count")]
    pub match_count: usize,
    /// ANN candidate multiplier before exact re-rank.
    #[serde(default = "default_overfetch_factor")]
    pub overfetch_factor: usize,
    /// Bound on concurrent sub-query retrievals and grading calls.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            search_type: default_search_type(),
            match_count: default_match_count(),
            overfetch_factor: default_overfetch_factor(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_search_type() -> String {
    "hybrid".to_string()
}
fn default_match_count() -> usize {
    5
}
fn default_overfetch_factor() -> usize {
    4
}
fn default_max_concurrency() -> usize {
    4
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.max_chunk_size < config.chunking.chunk_size {
        anyhow::bail!("chunking.max_chunk_size must be >= chunking.chunk_size");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be < chunking.chunk_size");
    }

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    match config.retrieval.search_type.as_str() {
        "semantic" | "text" | "hybrid" => {}
        other => anyhow::bail!(
            "Unknown retrieval.search_type: '{}'. Must be semantic, text, or hybrid.",
            other
        ),
    }
    if config.retrieval.match_count < 1 || config.retrieval.match_count > 50 {
        anyhow::bail!("retrieval.match_count must be in 1..=50");
    }
    if config.retrieval.max_concurrency == 0 {
        anyhow::bail!("retrieval.max_concurrency must be > 0");
    }

    Ok(config)
}
