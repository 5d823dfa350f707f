//! # Campus Chat
//!
//! A retrieval-augmented chat service for the SRMIST Ramapuram
//! university website.
//!
//! The ingestion pipeline (crawler, chunker, embedder) lives elsewhere
//! and maintains the SQLite index; this crate consumes that index and
//! serves answers with a session-based free-query gate.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────────────────────┐
//! │  Client   │──▶│ Session gate ─▶ Retrieval ─▶ Context      │
//! │ HTTP/REPL │◀──│   ─▶ Generation (stream) ─▶ Formatter     │
//! └──────────┘   └──────────────┬───────────────────────────┘
//!                               │
//!                        ┌──────┴─────┐
//!                        │  SQLite     │
//!                        │ FTS5 + Vec  │
//!                        └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`session`] | Free-query quota state machine |
//! | [`store`] | Session store with per-session locking |
//! | [`retrieval`] | Keyword, semantic, and hybrid search over the index |
//! | [`context`] | Structured context assembly |
//! | [`generate`] | Gemini generation backend |
//! | [`format`] | Table-marker answer formatting |
//! | [`citations`] | Source citation policy |
//! | [`pipeline`] | Streaming response coordinator |
//! | [`server`] | HTTP/SSE API |
//! | [`usage`] | Email capture and query logging |

pub mod citations;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod format;
pub mod generate;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod prompt;
pub mod repl;
pub mod retrieval;
pub mod server;
pub mod session;
pub mod store;
pub mod usage;
