//! # Quarry CLI (`qry`)
//!
//! The `qry` binary is the primary interface for Quarry. Every command runs
//! as an explicit caller identity so row-level security is exercised end to
//! end.
//!
//! ## Usage
//!
//! ```bash
//! qry --config ./config/quarry.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `qry init` | Create the SQLite database and run schema migrations |
//! | `qry ingest <file>` | Chunk, embed, and store a document |
//! | `qry search "<query>"` | Search indexed chunks (semantic/text/hybrid) |
//! | `qry ask "<query>"` | Run the corrective retrieval pipeline |
//! | `qry share <id>` | Grant access to a document |
//! | `qry delete <id>` | Delete a document and its chunks |
//! | `qry rewrite "<query>"` | Expand a terse query into a fuller one |

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use quarry::access::SharingGrant;
use quarry::chat::HttpChat;
use quarry::config::{load_config, Config};
use quarry::embedding::HttpEmbedder;
use quarry::ingest::{IngestRequest, Ingestor};
use quarry::models::Caller;
use quarry::retriever::{format_citations, CorrectiveRetriever, RetrieveRequest};
use quarry::search::{SearchEngine, SearchMode};
use quarry::store::sqlite::SqliteStore;
use quarry::store::Store;

/// Quarry — a multi-tenant hybrid retrieval engine.
#[derive(Parser)]
#[command(
    name = "qry",
    about = "Quarry — a multi-tenant hybrid retrieval engine with corrective RAG refinement",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/quarry.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Caller identity flags shared by all data commands.
#[derive(Args, Clone)]
struct CallerArgs {
    /// Caller id (owner id for ingestion).
    #[arg(long = "as-id", default_value = "")]
    caller_id: String,

    /// Caller label, e.g. an email address.
    #[arg(long = "as-label", default_value = "")]
    caller_label: String,

    /// Group membership; repeatable.
    #[arg(long = "group")]
    groups: Vec<String>,

    /// Run as an admin (bypasses row-level security).
    #[arg(long)]
    admin: bool,
}

impl CallerArgs {
    fn caller(&self) -> Caller {
        Caller {
            id: self.caller_id.clone(),
            label: self.caller_label.clone(),
            groups: self.groups.clone(),
            is_admin: self.admin,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest a document from a file (or stdin when no file is given).
    Ingest {
        /// Path to a UTF-8 text file.
        file: Option<PathBuf>,

        #[arg(long)]
        title: String,

        /// Origin identifier, e.g. a URL or connector name.
        #[arg(long)]
        source: String,

        #[arg(long)]
        source_type: Option<String>,

        /// Repeatable document tag.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Make the document visible to everyone.
        #[arg(long)]
        public: bool,

        /// Identity (id or label) to share with; repeatable.
        #[arg(long = "share-with")]
        share_with: Vec<String>,

        /// Group to share with; repeatable.
        #[arg(long = "share-group")]
        share_groups: Vec<String>,

        #[command(flatten)]
        caller: CallerArgs,
    },

    /// Search indexed chunks.
    Search {
        query: String,

        /// semantic, text, or hybrid.
        #[arg(long, default_value = "hybrid")]
        mode: String,

        /// Maximum results (1..=50).
        #[arg(long)]
        match_count: Option<usize>,

        /// Metadata equality filter, `key=value`; repeatable.
        #[arg(long = "filter")]
        filters: Vec<String>,

        #[command(flatten)]
        caller: CallerArgs,
    },

    /// Answer a question with the corrective retrieval pipeline.
    Ask {
        query: String,

        #[arg(long)]
        mode: Option<String>,

        #[arg(long)]
        match_count: Option<usize>,

        /// Overall deadline in seconds.
        #[arg(long)]
        timeout_secs: Option<u64>,

        #[command(flatten)]
        caller: CallerArgs,
    },

    /// Grant access to a document (merges with existing grants).
    Share {
        /// Document id.
        id: String,

        /// Make the document public.
        #[arg(long)]
        public: bool,

        /// Identity (id or label) to add; repeatable.
        #[arg(long = "with")]
        with: Vec<String>,

        /// Group to add; repeatable.
        #[arg(long = "group-id")]
        group_ids: Vec<String>,

        #[command(flatten)]
        caller: CallerArgs,
    },

    /// Delete a document and all of its chunks.
    Delete {
        id: String,

        #[command(flatten)]
        caller: CallerArgs,
    },

    /// Expand a terse query into a fuller search query.
    Rewrite { query: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&config).await,
        Commands::Ingest {
            file,
            title,
            source,
            source_type,
            tags,
            public,
            share_with,
            share_groups,
            caller,
        } => {
            run_ingest(
                &config,
                file,
                title,
                source,
                source_type,
                tags,
                public,
                share_with,
                share_groups,
                &caller.caller(),
            )
            .await
        }
        Commands::Search {
            query,
            mode,
            match_count,
            filters,
            caller,
        } => run_search(&config, &query, &mode, match_count, &filters, &caller.caller()).await,
        Commands::Ask {
            query,
            mode,
            match_count,
            timeout_secs,
            caller,
        } => run_ask(&config, &query, mode, match_count, timeout_secs, &caller.caller()).await,
        Commands::Share {
            id,
            public,
            with,
            group_ids,
            caller,
        } => run_share(&config, &id, public, with, group_ids, &caller.caller()).await,
        Commands::Delete { id, caller } => run_delete(&config, &id, &caller.caller()).await,
        Commands::Rewrite { query } => run_rewrite(&config, &query).await,
    }
}

async fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let pool = quarry::db::connect(&config.db.path).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

fn build_engine(config: &Config, store: Arc<SqliteStore>) -> Result<SearchEngine> {
    let embedder = HttpEmbedder::new(&config.embedding, config.chunking.max_tokens)?;
    Ok(SearchEngine::new(
        store,
        Arc::new(embedder),
        config.retrieval.overfetch_factor,
    ))
}

async fn run_init(config: &Config) -> Result<()> {
    let pool = quarry::db::connect(&config.db.path).await?;
    quarry::migrate::run_migrations(&pool).await?;
    pool.close().await;
    println!("initialized {}", config.db.path.display());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_ingest(
    config: &Config,
    file: Option<PathBuf>,
    title: String,
    source: String,
    source_type: Option<String>,
    tags: Vec<String>,
    public: bool,
    share_with: Vec<String>,
    share_groups: Vec<String>,
    caller: &Caller,
) -> Result<()> {
    let content = match file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            use std::io::Read;
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let store = open_store(config).await?;
    let embedder = Arc::new(HttpEmbedder::new(
        &config.embedding,
        config.chunking.max_tokens,
    )?);
    let chat = if config.embedding.contextualize {
        Some(Arc::new(HttpChat::new(&config.chat)?) as Arc<dyn quarry::chat::ChatProvider>)
    } else {
        None
    };

    let ingestor = Ingestor::new(
        store,
        embedder,
        chat,
        config.chunking.clone(),
        config.embedding.batch_size,
    );

    let request = IngestRequest {
        content,
        title,
        source,
        source_type,
        tags,
        extra: BTreeMap::new(),
        owner_id: caller.id.clone(),
        owner_label: caller.label.clone(),
        is_public: public,
        shared_with: share_with.into_iter().collect::<BTreeSet<_>>(),
        group_ids: share_groups.into_iter().collect::<BTreeSet<_>>(),
    };

    let mut on_progress = |batch: usize, total: usize| {
        println!("  embedding batch {}/{}", batch + 1, total);
    };
    let report = ingestor.ingest(request, Some(&mut on_progress)).await?;

    println!("ingested document {}", report.document_id);
    println!("  chunks: {}", report.chunk_count);
    if report.contextualized > 0 {
        println!("  contextualized: {}", report.contextualized);
    }
    Ok(())
}

fn parse_filters(filters: &[String]) -> Result<Option<quarry::store::FieldFilter>> {
    if filters.is_empty() {
        return Ok(None);
    }
    let mut field_filter = quarry::store::FieldFilter::default();
    for raw in filters {
        let (key, value) = raw
            .split_once('=')
            .with_context(|| format!("Invalid filter '{raw}', expected key=value"))?;
        field_filter
            .entries
            .insert(key.to_string(), value.to_string());
    }
    Ok(Some(field_filter))
}

async fn run_search(
    config: &Config,
    query: &str,
    mode: &str,
    match_count: Option<usize>,
    filters: &[String],
    caller: &Caller,
) -> Result<()> {
    let mode: SearchMode = mode.parse()?;
    let match_count = match_count.unwrap_or(config.retrieval.match_count);
    let filter = parse_filters(filters)?;

    let store = open_store(config).await?;
    let engine = build_engine(config, store)?;
    let access = quarry::access::AccessFilter::for_caller(caller);

    let results = engine
        .search(mode, query, match_count, &access, filter.as_ref())
        .await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {}",
            i + 1,
            result.similarity,
            result.metadata.display_title()
        );
        let source = result.metadata.display_source();
        if !source.is_empty() {
            println!("    source: {source}");
        }
        println!(
            "    excerpt: \"{}\"",
            result.content.replace('\n', " ").trim()
        );
        println!("    chunk: {}  document: {}", result.chunk_id, result.document_id);
        println!();
    }
    Ok(())
}

async fn run_ask(
    config: &Config,
    query: &str,
    mode: Option<String>,
    match_count: Option<usize>,
    timeout_secs: Option<u64>,
    caller: &Caller,
) -> Result<()> {
    let mode: SearchMode = mode
        .as_deref()
        .unwrap_or(&config.retrieval.search_type)
        .parse()?;

    let store = open_store(config).await?;
    let engine = build_engine(config, store)?;
    let chat = Arc::new(HttpChat::new(&config.chat)?);
    let retriever = CorrectiveRetriever::new(engine, chat, config.retrieval.max_concurrency);

    let request = RetrieveRequest {
        query: query.to_string(),
        match_count: match_count.unwrap_or(config.retrieval.match_count),
        mode,
        caller: caller.clone(),
        filter: None,
        deadline: timeout_secs.map(Duration::from_secs),
    };

    let answer = retriever.answer(&request).await?;

    println!("{}", answer.answer);
    if !answer.citations.is_empty() {
        println!();
        println!("{}", format_citations(&answer.citations));
    }
    Ok(())
}

async fn run_share(
    config: &Config,
    id: &str,
    public: bool,
    with: Vec<String>,
    group_ids: Vec<String>,
    caller: &Caller,
) -> Result<()> {
    let store = open_store(config).await?;

    let grant = SharingGrant {
        is_public: public.then_some(true),
        shared_with: with.into_iter().collect(),
        group_ids: group_ids.into_iter().collect(),
    };

    let doc = store.update_sharing(id, &grant, caller).await?;
    println!("shared document {id}");
    println!("  public: {}", doc.access.is_public);
    println!(
        "  shared_with: {}",
        doc.access.shared_with.iter().cloned().collect::<Vec<_>>().join(", ")
    );
    println!(
        "  group_ids: {}",
        doc.access.group_ids.iter().cloned().collect::<Vec<_>>().join(", ")
    );
    Ok(())
}

async fn run_delete(config: &Config, id: &str, caller: &Caller) -> Result<()> {
    let store = open_store(config).await?;
    store.delete_document(id, caller).await?;
    println!("deleted document {id}");
    Ok(())
}

async fn run_rewrite(config: &Config, query: &str) -> Result<()> {
    let chat = HttpChat::new(&config.chat)?;
    let rewritten = quarry::retriever::rewrite_query_with(&chat, query).await;
    println!("{rewritten}");
    Ok(())
}
