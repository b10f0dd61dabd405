//! # Quarry
//!
//! A multi-tenant hybrid retrieval engine with corrective RAG refinement.
//!
//! Quarry stores chunked, embedded documents with per-document access control
//! (ownership, public/private, explicit sharing, group sharing) and answers
//! natural-language queries by fusing vector similarity and keyword search,
//! optionally refined by a corrective pipeline that decomposes the query,
//! grades retrieved chunks, synthesizes an answer, and numbers its citations.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────────┐   ┌───────────┐
//! │  Ingest    │──▶│ Chunk → Embed    │──▶│  SQLite    │
//! │ (caller)   │   │ (+contextualize) │   │ FTS5+Vec  │
//! └───────────┘   └──────────────────┘   └─────┬─────┘
//!                                              │  access filter on
//!                                              │  every query
//!                 ┌────────────────────────────┤
//!                 ▼                            ▼
//!        ┌────────────────┐         ┌──────────────────────┐
//!        │  SearchEngine  │◀────────│ CorrectiveRetriever  │
//!        │ sem/text/hybrid│         │ decompose·grade·cite │
//!        └────────────────┘         └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`access`] | Row-level security predicate |
//! | [`chunk`] | Overlapping-window text chunking |
//! | [`embedding`] | Embedding provider and chunk-embedding pipeline |
//! | [`chat`] | Chat-completion provider |
//! | [`store`] | Storage trait, in-memory and SQLite backends |
//! | [`search`] | Semantic, keyword, and hybrid search |
//! | [`retriever`] | Corrective retrieval pipeline |
//! | [`ingest`] | Per-document ingestion pipeline |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod access;
pub mod chat;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod retriever;
pub mod search;
pub mod store;

pub use error::{Error, Result};
