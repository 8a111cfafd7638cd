//! LLM reranking pass over fused retrieval results.
//!
//! Optional refinement between retrieval and prompt assembly: the top
//! `rerank_cutoff` fused results are scored for relevance by the resident
//! model in a single batched call, then re-sorted by that score. Results
//! past the cutoff keep their fused order below the reranked head.
//!
//! The pass is strictly best-effort. If the engine has no resident model,
//! or the call fails, or its output cannot be parsed, the fused order is
//! returned untouched with a log record.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::generation::{EngineState, GenerationEngine};
use crate::models::{GenerationParams, RetrievalResult};

pub struct Reranker {
    engine: Arc<GenerationEngine>,
    cutoff: usize,
}

impl Reranker {
    pub fn new(engine: Arc<GenerationEngine>, cutoff: usize) -> Self {
        Self { engine, cutoff }
    }

    /// Re-order `results` by model-judged relevance to `query`. Never
    /// fails and never changes the set of results, only their order.
    pub async fn rerank(
        &self,
        query: &str,
        mut results: Vec<RetrievalResult>,
    ) -> Vec<RetrievalResult> {
        let head_len = self.cutoff.min(results.len());
        if head_len < 2 {
            return results;
        }
        match self.engine.state() {
            EngineState::Ready | EngineState::Generating => {}
            state => {
                debug!(state = state.as_str(), "reranker skipped, engine not ready");
                return results;
            }
        }

        let tail = results.split_off(head_len);
        let head = results;

        let prompt = scoring_prompt(query, &head);
        let params = GenerationParams {
            temperature: 0.0,
            max_tokens: 256,
            ..self.engine.default_params()
        };

        let response = match self.engine.generate(&prompt, Some(params)).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "rerank call failed, keeping fused order");
                return rejoin(head, tail);
            }
        };

        let Some(scores) = parse_scores(&response, head.len()) else {
            warn!("rerank response unparseable, keeping fused order");
            return rejoin(head, tail);
        };

        let mut indexed: Vec<(f64, RetrievalResult)> =
            scores.into_iter().zip(head).collect();
        // Stable sort: equal scores keep fused order.
        indexed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        rejoin(indexed.into_iter().map(|(_, r)| r).collect(), tail)
    }
}

fn rejoin(head: Vec<RetrievalResult>, tail: Vec<RetrievalResult>) -> Vec<RetrievalResult> {
    head.into_iter()
        .chain(tail)
        .enumerate()
        .map(|(rank, r)| RetrievalResult { rank, ..r })
        .collect()
}

fn scoring_prompt(query: &str, results: &[RetrievalResult]) -> String {
    let mut prompt = String::from(
        "Score each passage for relevance to the query on a 0-10 scale. \
Respond with only a JSON array of numbers, one per passage, in order.\n\n",
    );
    prompt.push_str(&format!("Query: {}\n\n", query));
    for (i, r) in results.iter().enumerate() {
        prompt.push_str(&format!("Passage {}: {}\n\n", i + 1, r.text.trim()));
    }
    prompt.push_str("Scores:");
    prompt
}

/// Pull a JSON array of numbers out of the model's reply, tolerating prose
/// around it. Returns `None` unless exactly `expected` scores parse.
fn parse_scores(response: &str, expected: usize) -> Option<Vec<f64>> {
    let start = response.find('[')?;
    let end = response[start..].find(']')? + start;
    let scores: Vec<f64> = serde_json::from_str(&response[start..=end]).ok()?;
    (scores.len() == expected).then_some(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::ScriptedBackend;

    fn result(id: &str, rank: usize) -> RetrievalResult {
        RetrievalResult {
            chunk_id: id.to_string(),
            document_id: "doc".to_string(),
            text: format!("text for {}", id),
            score: 1.0 / (rank + 1) as f64,
            rank,
        }
    }

    fn engine_with_reply(reply: &str) -> Arc<GenerationEngine> {
        Arc::new(GenerationEngine::new(
            Arc::new(ScriptedBackend::new(vec![reply.to_string()])),
            GenerationParams::default(),
        ))
    }

    #[test]
    fn test_parse_scores_plain_array() {
        assert_eq!(parse_scores("[3, 9, 1]", 3), Some(vec![3.0, 9.0, 1.0]));
    }

    #[test]
    fn test_parse_scores_with_surrounding_prose() {
        let reply = "Sure, here are the scores: [2.5, 8] based on the passages.";
        assert_eq!(parse_scores(reply, 2), Some(vec![2.5, 8.0]));
    }

    #[test]
    fn test_parse_scores_wrong_count() {
        assert_eq!(parse_scores("[1, 2]", 3), None);
        assert_eq!(parse_scores("no array here", 1), None);
    }

    #[tokio::test]
    async fn test_skips_when_engine_unloaded() {
        let engine = engine_with_reply("[9, 1]");
        let reranker = Reranker::new(engine, 8);
        let input = vec![result("a", 0), result("b", 1)];
        let output = reranker.rerank("q", input.clone()).await;
        assert_eq!(output[0].chunk_id, "a");
        assert_eq!(output[1].chunk_id, "b");
    }

    #[tokio::test]
    async fn test_reorders_by_model_scores() {
        let engine = engine_with_reply("[1, 9, 5]");
        engine.load("test-model").await.unwrap();
        let reranker = Reranker::new(engine, 8);

        let input = vec![result("a", 0), result("b", 1), result("c", 2)];
        let output = reranker.rerank("q", input).await;

        let ids: Vec<&str> = output.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        // Ranks are reassigned to match the new order.
        assert_eq!(
            output.iter().map(|r| r.rank).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[tokio::test]
    async fn test_tail_beyond_cutoff_keeps_fused_order() {
        let engine = engine_with_reply("[1, 9]");
        engine.load("test-model").await.unwrap();
        let reranker = Reranker::new(engine, 2);

        let input = vec![result("a", 0), result("b", 1), result("c", 2)];
        let output = reranker.rerank("q", input).await;

        let ids: Vec<&str> = output.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_unparseable_reply_keeps_fused_order() {
        let engine = engine_with_reply("I cannot score these passages.");
        engine.load("test-model").await.unwrap();
        let reranker = Reranker::new(engine, 8);

        let input = vec![result("a", 0), result("b", 1)];
        let output = reranker.rerank("q", input).await;
        let ids: Vec<&str> = output.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
