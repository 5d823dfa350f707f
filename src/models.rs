//! Core data types shared across the retrieval, generation, and gating
//! pipeline.

use serde::Serialize;

/// How a stored chunk should be rendered into the generation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Plain,
    Table,
    SectionHeading,
}

impl ChunkType {
    /// Parse the `chunk_type` column written by the ingestion pipeline.
    /// Unknown or missing values fall back to plain text.
    pub fn from_label(label: Option<&str>) -> Self {
        match label.unwrap_or("") {
            "table_complete" => ChunkType::Table,
            "section_h1" | "section_h2" => ChunkType::SectionHeading,
            _ => ChunkType::Plain,
        }
    }
}

/// One deduplicated chunk of source content with provenance metadata,
/// as returned by the retrieval engine. Read-only; consumed per query.
#[derive(Debug, Clone)]
pub struct Passage {
    pub text: String,
    pub chunk_type: ChunkType,
    pub title: Option<String>,
    pub source_url: Option<String>,
    pub score: f64,
}

/// Incremental answer event emitted by the streaming coordinator.
///
/// `content` grows monotonically by concatenation across a stream;
/// exactly one event per stream has `done = true`, and only that event
/// may carry non-empty `sources`.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerEvent {
    pub content: String,
    pub sources: String,
    pub done: bool,
}

impl AnswerEvent {
    pub fn partial(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            sources: String::new(),
            done: false,
        }
    }

    pub fn terminal(content: impl Into<String>, sources: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            sources: sources.into(),
            done: true,
        }
    }
}

/// Outcome of the pre-generation gate check for one incoming message.
///
/// Decided before any retrieval or generation work happens, so blocked
/// requests never spend an LLM call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Process normally; counts against the free quota while anonymous.
    Allow,
    /// Process a pending message replay after a skip or email submission.
    /// Does not count against the quota.
    AllowAsPendingReplay,
    /// Block and ask for an email address before processing.
    RequireEmail { skip_allowed: bool },
}
