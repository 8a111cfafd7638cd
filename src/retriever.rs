//! Hybrid retrieval: semantic + lexical search fused with RRF.
//!
//! The semantic channel queries the vector store; the lexical channel
//! queries the FTS5 index over the same chunks. Each chunk's fused score
//! is the sum of `1 / (k + rank)` over the lists it appears in. A chunk
//! absent from one list simply contributes nothing for that term.
//!
//! If one channel fails the retriever degrades to the other alone, with a
//! log record. Only when both channels fail does the caller see an error.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::{Row, SqlitePool};
use tracing::warn;

use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingModel;
use crate::error::RetrievalError;
use crate::models::RetrievalResult;
use crate::store::VectorStore;

/// Which retrieval channels to consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Keyword,
    Semantic,
    Hybrid,
}

impl SearchMode {
    pub fn parse(s: &str) -> Option<SearchMode> {
        match s {
            "keyword" => Some(SearchMode::Keyword),
            "semantic" => Some(SearchMode::Semantic),
            "hybrid" => Some(SearchMode::Hybrid),
            _ => None,
        }
    }
}

pub struct HybridRetriever {
    pool: SqlitePool,
    store: Arc<VectorStore>,
    embedder: Arc<dyn EmbeddingModel>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        pool: SqlitePool,
        store: Arc<VectorStore>,
        embedder: Arc<dyn EmbeddingModel>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            pool,
            store,
            embedder,
            config,
        }
    }

    /// Retrieve the top chunks for `query`, deduplicated by chunk id and
    /// ranked by fused score.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<RetrievalResult>, RetrievalError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let semantic = match self.semantic_candidates(query).await {
            Ok(results) => Some(results),
            Err(e) => {
                warn!(error = %e, "semantic search failed, degrading to lexical only");
                None
            }
        };

        let lexical = match self.lexical_candidates(query).await {
            Ok(results) => Some(results),
            Err(e) => {
                warn!(error = %e, "lexical search failed, degrading to semantic only");
                None
            }
        };

        let (semantic, lexical) = match (semantic, lexical) {
            (None, None) => return Err(RetrievalError::StoreUnavailable),
            pair => pair,
        };

        Ok(self.fuse(
            semantic.unwrap_or_default(),
            lexical.unwrap_or_default(),
        ))
    }

    /// Single-channel or hybrid retrieval. Single-channel modes fail hard
    /// when their channel is unavailable; only hybrid degrades.
    pub async fn retrieve_with_mode(
        &self,
        query: &str,
        mode: SearchMode,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut results = match mode {
            SearchMode::Hybrid => return self.retrieve(query).await,
            SearchMode::Keyword => self.lexical_candidates(query).await?,
            SearchMode::Semantic => self.semantic_candidates(query).await?,
        };
        results.truncate(self.config.top_k);
        for (rank, result) in results.iter_mut().enumerate() {
            result.rank = rank;
        }
        Ok(results)
    }

    async fn semantic_candidates(
        &self,
        query: &str,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        let query_vector = self.embedder.embed(query).await?;
        self.store
            .search(
                &query_vector,
                self.config.candidate_k,
                self.config.similarity_threshold,
                self.config.candidate_k,
            )
            .await
    }

    async fn lexical_candidates(
        &self,
        query: &str,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        let match_expr = fts_match_expression(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT f.chunk_id, f.document_id, c.text
            FROM chunks_fts f
            JOIN chunks c ON c.id = f.chunk_id
            WHERE chunks_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&match_expr)
        .bind(self.config.candidate_k as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .enumerate()
            .map(|(rank, row)| RetrievalResult {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                text: row.get("text"),
                score: 0.0,
                rank,
            })
            .collect())
    }

    /// Reciprocal Rank Fusion over the two candidate lists. Ranks are
    /// 1-based; the fused list is deduplicated by chunk id, sorted by
    /// fused score descending (chunk id breaks exact ties for a
    /// deterministic order), and truncated to `top_k`.
    fn fuse(
        &self,
        semantic: Vec<RetrievalResult>,
        lexical: Vec<RetrievalResult>,
    ) -> Vec<RetrievalResult> {
        let k = self.config.rrf_k;

        struct Fused {
            result: RetrievalResult,
            score: f64,
        }

        let mut by_chunk: HashMap<String, Fused> = HashMap::new();

        for list in [semantic, lexical] {
            for result in list {
                let contribution = 1.0 / (k + (result.rank + 1) as f64);
                match by_chunk.get_mut(&result.chunk_id) {
                    Some(entry) => entry.score += contribution,
                    None => {
                        by_chunk.insert(
                            result.chunk_id.clone(),
                            Fused {
                                result,
                                score: contribution,
                            },
                        );
                    }
                }
            }
        }

        let mut fused: Vec<Fused> = by_chunk.into_values().collect();
        fused.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.result.chunk_id.cmp(&b.result.chunk_id))
        });
        fused.truncate(self.config.top_k);

        fused
            .into_iter()
            .enumerate()
            .map(|(rank, f)| RetrievalResult {
                score: f.score,
                rank,
                ..f.result
            })
            .collect()
    }
}

/// Build a safe FTS5 MATCH expression: each term quoted, joined with OR so
/// any keyword containment counts. Raw user text would otherwise be parsed
/// as FTS query syntax.
fn fts_match_expression(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "")))
        .filter(|t| t.len() > 2)
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fts_expression_quotes_terms() {
        assert_eq!(
            fts_match_expression("rust async runtime"),
            "\"rust\" OR \"async\" OR \"runtime\""
        );
    }

    #[test]
    fn test_fts_expression_strips_embedded_quotes() {
        assert_eq!(fts_match_expression(r#"say "hello""#), "\"say\" OR \"hello\"");
    }

    #[test]
    fn test_fts_expression_empty_query() {
        assert_eq!(fts_match_expression("   "), "");
    }

    #[test]
    fn test_rrf_contribution_math() {
        // rank 0 in both lists with k=60: 2/61.
        let k: f64 = 60.0;
        let both = 1.0 / (k + 1.0) + 1.0 / (k + 1.0);
        let only_first = 1.0 / (k + 1.0);
        assert!(both > only_first);
        assert!((both - 2.0 / 61.0).abs() < 1e-12);
    }
}
