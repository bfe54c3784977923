//! # KG Engine
//!
//! **A knowledge-graph ingestion and query engine.**
//!
//! KG Engine turns unstructured documents into a queryable graph of
//! concepts, evidence sources, and typed relationships, then answers
//! semantic queries, path queries, and polarity-projection queries over
//! that graph.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌─────────────────────────────┐   ┌──────────┐
//! │ Documents │──▶│ Job Queue → Ingestion Worker │──▶│  SQLite   │
//! │ text/image│   │ chunk → extract → embed →    │   │  graph    │
//! └───────────┘   │ match → upsert               │   └────┬─────┘
//!                 └─────────────────────────────┘        │
//!                                   ┌─────────────────────┤
//!                                   ▼                     ▼
//!                             ┌──────────┐         ┌──────────┐
//!                             │   CLI    │         │   HTTP   │
//!                             │   (kg)   │         │  (axum)  │
//!                             └──────────┘         └──────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. Documents enter through the **job queue** ([`jobs`]): every mutation
//!    is an approval-gated, cost-estimated asynchronous job.
//! 2. The **ingestion worker** ([`ingest`]) chunks the text ([`chunker`]),
//!    extracts concepts and typed relationships via the LLM provider
//!    ([`extractor`]), embeds candidates ([`embedding`]), and deduplicates
//!    them against the graph by vector similarity ([`matcher`]).
//! 3. Unknown relationship types flow through the **vocabulary manager**
//!    ([`vocabulary`]): auto-expansion, zone tracking, and embedding-based
//!    consolidation under LLM adjudication.
//! 4. All graph state lives behind the **graph store facade** ([`graph`]),
//!    the only component allowed to mutate it.
//! 5. The **query engine** answers semantic search ([`search`]), bounded
//!    bidirectional pathfinding ([`pathfind`]), and polarity-axis
//!    projection ([`polarity`]), annotated with evidence-balance scores
//!    ([`grounding`]).
//! 6. Everything is exposed via the CLI (`kg`) and the HTTP API
//!    ([`server`]).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Typed error enum shared across the engine |
//! | [`models`] | Core data types: `Concept`, `Source`, `Relationship`, `Job` |
//! | [`db`] | SQLite connection pool with WAL mode |
//! | [`migrate`] | Database schema migrations (idempotent) |
//! | [`objects`] | Filesystem object store for raw document bytes |
//! | [`chunker`] | Word-budget chunker with boundary-aware overlap |
//! | [`embedding`] | Embedding provider trait, remote + mock, vector utils |
//! | [`extractor`] | LLM extraction provider with schema-validated decoding |
//! | [`vocabulary`] | Relationship-type vocabulary and consolidation engine |
//! | [`matcher`] | Concept deduplication by vector similarity |
//! | [`graph`] | Graph store facade: typed upsert/query primitives |
//! | [`grounding`] | Evidence-balance scoring over neighborhood edges |
//! | [`pathfind`] | Bidirectional BFS over batched one-hop queries |
//! | [`polarity`] | Axis projection, correlation, path coherence |
//! | [`jobs`] | Persisted job queue with approval gate |
//! | [`ingest`] | Ingestion pipeline: submission and per-job worker |
//! | [`scheduler`] | Worker pool, expiration and retention sweeps |
//! | [`search`] | Semantic concept search with grounding and evidence |
//! | [`server`] | HTTP/JSON API (Axum) with CORS |
//! | [`core`] | Process-wide composition root |

pub mod chunker;
pub mod config;
pub mod core;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extractor;
pub mod graph;
pub mod grounding;
pub mod ingest;
pub mod jobs;
pub mod matcher;
pub mod migrate;
pub mod models;
pub mod objects;
pub mod pathfind;
pub mod polarity;
pub mod scheduler;
pub mod search;
pub mod server;
pub mod vocabulary;
