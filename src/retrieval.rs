//! Retrieval engine over the externally built SQLite index.
//!
//! Given a query string, returns a ranked, deduplicated, relevance-
//! filtered set of context passages with provenance metadata. Keyword
//! candidates come from FTS5; semantic candidates compare a query
//! embedding against stored chunk vectors; hybrid mode merges both
//! channels with min-max normalized scores and a configurable alpha.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::config::{EmbeddingConfig, RetrievalConfig};
use crate::embedding;
use crate::models::{ChunkType, Passage};

/// Retrieval collaborator consumed by the streaming coordinator.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Passage>>;
}

/// Retriever backed by the ingestion pipeline's SQLite index.
pub struct IndexRetriever {
    pool: SqlitePool,
    retrieval: RetrievalConfig,
    embedding: EmbeddingConfig,
}

impl IndexRetriever {
    pub fn new(pool: SqlitePool, retrieval: RetrievalConfig, embedding: EmbeddingConfig) -> Self {
        Self {
            pool,
            retrieval,
            embedding,
        }
    }
}

#[async_trait]
impl Retriever for IndexRetriever {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Passage>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mode = self.retrieval.mode.as_str();
        let fetch_k = self.retrieval.fetch_k;

        let keyword_candidates = if mode == "keyword" || mode == "hybrid" {
            fetch_keyword_candidates(&self.pool, query, fetch_k).await?
        } else {
            Vec::new()
        };

        let vector_candidates = if mode == "semantic" || mode == "hybrid" {
            fetch_vector_candidates(&self.pool, &self.embedding, query, fetch_k).await?
        } else {
            Vec::new()
        };

        let effective_alpha = match mode {
            "keyword" => 0.0,
            "semantic" => 1.0,
            _ => self.retrieval.hybrid_alpha,
        };

        let merged = merge_candidates(&keyword_candidates, &vector_candidates, effective_alpha);
        Ok(rank_and_dedup(merged, k))
    }
}

// ============ Candidate types ============

#[derive(Debug, Clone)]
struct ChunkCandidate {
    chunk_id: String,
    text: String,
    chunk_type: Option<String>,
    title: Option<String>,
    source_url: Option<String>,
    raw_score: f64,
}

// ============ Keyword channel ============

async fn fetch_keyword_candidates(
    pool: &SqlitePool,
    query: &str,
    fetch_k: i64,
) -> Result<Vec<ChunkCandidate>> {
    let match_expr = fts_match_expression(query);
    if match_expr.is_empty() {
        return Ok(Vec::new());
    }

    let rows = sqlx::query(
        r#"
        SELECT chunks_fts.chunk_id, chunks_fts.rank, c.text, c.chunk_type, d.title, d.source_url
        FROM chunks_fts
        JOIN chunks c ON c.id = chunks_fts.chunk_id
        JOIN documents d ON d.id = c.document_id
        WHERE chunks_fts MATCH ?
        ORDER BY chunks_fts.rank
        LIMIT ?
        "#,
    )
    .bind(&match_expr)
    .bind(fetch_k)
    .fetch_all(pool)
    .await?;

    let candidates = rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            ChunkCandidate {
                chunk_id: row.get("chunk_id"),
                text: row.get("text"),
                chunk_type: row.get("chunk_type"),
                title: row.get("title"),
                source_url: row.get("source_url"),
                raw_score: -rank, // negate so higher = better
            }
        })
        .collect();

    Ok(candidates)
}

/// Escape free-form user text into an FTS5 OR-of-terms expression.
/// Quoting each token sidesteps FTS operator injection ("NEAR", "-", ...).
fn fts_match_expression(query: &str) -> String {
    query
        .split_whitespace()
        .filter(|t| t.chars().any(|c| c.is_alphanumeric()))
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

// ============ Vector channel ============

async fn fetch_vector_candidates(
    pool: &SqlitePool,
    embedding_cfg: &EmbeddingConfig,
    query: &str,
    fetch_k: i64,
) -> Result<Vec<ChunkCandidate>> {
    let query_vec = embedding::embed_query(embedding_cfg, query).await?;

    let rows = sqlx::query(
        r#"
        SELECT cv.chunk_id, cv.embedding, c.text, c.chunk_type, d.title, d.source_url
        FROM chunk_vectors cv
        JOIN chunks c ON c.id = cv.chunk_id
        JOIN documents d ON d.id = c.document_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut candidates: Vec<ChunkCandidate> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let vec = embedding::blob_to_vec(&blob);
            let similarity = embedding::cosine_similarity(&query_vec, &vec) as f64;
            ChunkCandidate {
                chunk_id: row.get("chunk_id"),
                text: row.get("text"),
                chunk_type: row.get("chunk_type"),
                title: row.get("title"),
                source_url: row.get("source_url"),
                raw_score: similarity,
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(fetch_k as usize);

    Ok(candidates)
}

// ============ Merging & ranking ============

/// Min-max normalize scores to [0, 1] per channel.
fn normalize_scores(candidates: &[ChunkCandidate]) -> HashMap<String, f64> {
    if candidates.is_empty() {
        return HashMap::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c.chunk_id.clone(), norm)
        })
        .collect()
}

fn merge_candidates(
    keyword: &[ChunkCandidate],
    vector: &[ChunkCandidate],
    alpha: f64,
) -> Vec<(ChunkCandidate, f64)> {
    let kw_map = normalize_scores(keyword);
    let vec_map = normalize_scores(vector);

    let mut all: HashMap<&str, &ChunkCandidate> = HashMap::new();
    for c in keyword {
        all.entry(c.chunk_id.as_str()).or_insert(c);
    }
    for c in vector {
        all.entry(c.chunk_id.as_str()).or_insert(c);
    }

    all.into_values()
        .map(|c| {
            let k = kw_map.get(&c.chunk_id).copied().unwrap_or(0.0);
            let v = vec_map.get(&c.chunk_id).copied().unwrap_or(0.0);
            (c.clone(), (1.0 - alpha) * k + alpha * v)
        })
        .collect()
}

/// Sort by hybrid score (chunk id as tiebreak for determinism), drop
/// exact duplicate texts, truncate to `k`, and map into passages.
fn rank_and_dedup(mut scored: Vec<(ChunkCandidate, f64)>, k: usize) -> Vec<Passage> {
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.chunk_id.cmp(&b.0.chunk_id))
    });

    let mut seen = std::collections::HashSet::new();
    let mut passages = Vec::new();

    for (cand, score) in scored {
        let trimmed = cand.text.trim().to_string();
        if trimmed.is_empty() || !seen.insert(trimmed.clone()) {
            continue;
        }

        passages.push(Passage {
            text: trimmed,
            chunk_type: ChunkType::from_label(cand.chunk_type.as_deref()),
            title: cand.title,
            source_url: cand.source_url,
            score,
        });

        if passages.len() == k {
            break;
        }
    }

    passages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: &str, text: &str, score: f64) -> ChunkCandidate {
        ChunkCandidate {
            chunk_id: id.to_string(),
            text: text.to_string(),
            chunk_type: None,
            title: None,
            source_url: None,
            raw_score: score,
        }
    }

    #[test]
    fn test_normalize_range() {
        let cands = vec![cand("c1", "a", 10.0), cand("c2", "b", 5.0), cand("c3", "c", 0.0)];
        let norm = normalize_scores(&cands);
        assert!((norm["c1"] - 1.0).abs() < 1e-9);
        assert!((norm["c2"] - 0.5).abs() < 1e-9);
        assert!((norm["c3"] - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_all_equal_gives_unit() {
        let cands = vec![cand("c1", "a", 3.0), cand("c2", "b", 3.0)];
        let norm = normalize_scores(&cands);
        assert!((norm["c1"] - 1.0).abs() < 1e-9);
        assert!((norm["c2"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_alpha_zero_is_keyword_order() {
        let kw = vec![cand("c1", "a", 10.0), cand("c2", "b", 5.0)];
        let vec_c = vec![cand("c1", "a", 0.1), cand("c2", "b", 0.9)];
        let merged = merge_candidates(&kw, &vec_c, 0.0);
        let ranked = rank_and_dedup(merged, 10);
        assert_eq!(ranked[0].text, "a");
    }

    #[test]
    fn test_alpha_one_is_vector_order() {
        let kw = vec![cand("c1", "a", 10.0), cand("c2", "b", 5.0)];
        let vec_c = vec![cand("c1", "a", 0.1), cand("c2", "b", 0.9)];
        let merged = merge_candidates(&kw, &vec_c, 1.0);
        let ranked = rank_and_dedup(merged, 10);
        assert_eq!(ranked[0].text, "b");
    }

    #[test]
    fn test_dedup_by_exact_text() {
        let scored = vec![
            (cand("c1", "same text", 0.0), 1.0),
            (cand("c2", "same text", 0.0), 0.9),
            (cand("c3", "other text", 0.0), 0.8),
        ];
        let ranked = rank_and_dedup(scored, 10);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].text, "same text");
        assert_eq!(ranked[1].text, "other text");
    }

    #[test]
    fn test_truncates_to_k() {
        let scored: Vec<_> = (0..20)
            .map(|i| (cand(&format!("c{i}"), &format!("text {i}"), 0.0), 1.0 - i as f64 * 0.01))
            .collect();
        let ranked = rank_and_dedup(scored, 10);
        assert_eq!(ranked.len(), 10);
    }

    #[test]
    fn test_fts_match_expression_quotes_tokens() {
        assert_eq!(
            fts_match_expression("hostel fees 2024"),
            "\"hostel\" OR \"fees\" OR \"2024\""
        );
        assert_eq!(fts_match_expression("NEAR - \"\""), "\"NEAR\"");
        assert_eq!(fts_match_expression("   "), "");
    }
}
