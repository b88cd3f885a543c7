//! Context stage: budget-limited retrieval of relevant code.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::domain::errors::{AgentError, AgentResult, ErrorKind};
use crate::domain::models::{CodeChunk, ContextConfig, Intent, RetrievedContext, StageId};
use crate::domain::ports::{CodeIndex, IndexQuery};
use crate::services::stage::{Stage, StageContext, StageOutcome};

/// Token estimate for `text` at a fixed characters-per-token ratio.
pub fn estimate_tokens(text: &str, chars_per_token: usize) -> usize {
    let chars = text.chars().count();
    chars.div_ceil(chars_per_token.max(1))
}

/// Descending relevance; ties broken by path, then start line.
pub fn rank_order(a: &CodeChunk, b: &CodeChunk) -> Ordering {
    b.relevance
        .partial_cmp(&a.relevance)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.path.cmp(&b.path))
        .then_with(|| a.start_line.cmp(&b.start_line))
}

pub struct ContextStage {
    index: Arc<dyn CodeIndex>,
    config: ContextConfig,
}

impl ContextStage {
    pub fn new(index: Arc<dyn CodeIndex>, config: ContextConfig) -> Self {
        Self { index, config }
    }

    pub async fn retrieve(&self, intent: &Intent) -> AgentResult<RetrievedContext> {
        let query = IndexQuery {
            text: intent.query_text(),
            terms: intent.entities.clone(),
            scope: Some(intent.scope),
            limit: self.config.max_candidates,
        };

        let candidates = self
            .index
            .search(&query)
            .await
            .map_err(|e| e.into_agent_error(StageId::Context))?;
        let candidate_count = candidates.len();

        let mut seen = HashSet::new();
        let mut eligible: Vec<CodeChunk> = candidates
            .into_iter()
            .filter(|c| c.score.is_finite() && c.score >= self.config.relevance_floor)
            .map(|c| c.chunk.with_relevance(c.score.clamp(0.0, 1.0)))
            .filter(|c| seen.insert((c.path.clone(), c.start_line, c.end_line)))
            .collect();

        if eligible.is_empty() {
            return Err(AgentError::new(
                StageId::Context,
                ErrorKind::InsufficientContext,
                format!(
                    "none of {candidate_count} candidates met relevance floor {}",
                    self.config.relevance_floor
                ),
            ));
        }

        eligible.sort_by(rank_order);
        let context = self.fill_budget(eligible);

        if context.is_empty() {
            return Err(AgentError::new(
                StageId::Context,
                ErrorKind::InsufficientContext,
                format!(
                    "top-ranked chunk exceeds token budget {}",
                    self.config.token_budget
                ),
            ));
        }

        info!(
            candidates = candidate_count,
            selected = context.chunks.len(),
            tokens_used = context.tokens_used,
            token_budget = context.token_budget,
            "context retrieved"
        );
        Ok(context)
    }

    /// Greedy fill in rank order; the first chunk that does not fit ends it.
    fn fill_budget(&self, ranked: Vec<CodeChunk>) -> RetrievedContext {
        let mut context = RetrievedContext {
            token_budget: self.config.token_budget,
            ..RetrievedContext::default()
        };

        for chunk in ranked {
            let tokens = estimate_tokens(&chunk.content, self.config.chars_per_token);
            if context.tokens_used + tokens > self.config.token_budget {
                debug!(
                    path = %chunk.path,
                    tokens,
                    remaining = self.config.token_budget - context.tokens_used,
                    "token budget reached"
                );
                break;
            }
            context.tokens_used += tokens;
            context.chunks.push(chunk);
        }

        context
    }
}

#[async_trait]
impl Stage for ContextStage {
    type Input = Intent;
    type Output = RetrievedContext;

    fn id(&self) -> StageId {
        StageId::Context
    }

    async fn run(&self, input: &Intent, _ctx: &StageContext) -> StageOutcome<RetrievedContext> {
        self.retrieve(input).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{IndexError, ScoredChunk};
    use crate::test_support::{chunk, intent};

    struct FixedIndex(Result<Vec<ScoredChunk>, IndexError>);

    #[async_trait]
    impl CodeIndex for FixedIndex {
        async fn search(&self, _query: &IndexQuery) -> Result<Vec<ScoredChunk>, IndexError> {
            self.0.clone()
        }
    }

    fn scored(path: &str, line: usize, content: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: chunk(path, line, content, 0.0),
            score,
        }
    }

    fn stage(results: Vec<ScoredChunk>, budget: usize) -> ContextStage {
        ContextStage::new(
            Arc::new(FixedIndex(Ok(results))),
            ContextConfig {
                token_budget: budget,
                chars_per_token: 4,
                relevance_floor: 0.2,
                max_candidates: 50,
            },
        )
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens("abcd", 4), 1);
        assert_eq!(estimate_tokens("abcde", 4), 2);
        assert_eq!(estimate_tokens("", 4), 0);
    }

    #[tokio::test]
    async fn test_ranked_by_relevance_with_ties_broken_by_path() {
        let ctx = stage(
            vec![
                scored("b.rs", 1, "fn b() {}", 0.5),
                scored("a.rs", 10, "fn a2() {}", 0.5),
                scored("a.rs", 1, "fn a1() {}", 0.5),
                scored("c.rs", 1, "fn c() {}", 0.9),
            ],
            1_000,
        )
        .retrieve(&intent(0.9))
        .await
        .unwrap();

        let order: Vec<(&str, usize)> = ctx.chunks.iter().map(|c| (c.path.as_str(), c.start_line)).collect();
        assert_eq!(order, vec![("c.rs", 1), ("a.rs", 1), ("a.rs", 10), ("b.rs", 1)]);
    }

    #[tokio::test]
    async fn test_budget_stops_at_first_chunk_that_does_not_fit() {
        let ctx = stage(
            vec![
                scored("a.rs", 1, &"x".repeat(40), 0.9),
                scored("b.rs", 1, &"y".repeat(40), 0.8),
                scored("c.rs", 1, "z", 0.7),
            ],
            15,
        )
        .retrieve(&intent(0.9))
        .await
        .unwrap();

        assert_eq!(ctx.chunks.len(), 1);
        assert_eq!(ctx.tokens_used, 10);
        assert!(ctx.tokens_used <= ctx.token_budget);
    }

    #[tokio::test]
    async fn test_nothing_above_floor_is_insufficient_context() {
        let err = stage(vec![scored("a.rs", 1, "fn a() {}", 0.1)], 1_000)
            .retrieve(&intent(0.9))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InsufficientContext);
        assert_eq!(err.severity, crate::domain::errors::Severity::Recoverable);
    }

    #[tokio::test]
    async fn test_index_outage_is_transient() {
        let stage = ContextStage::new(
            Arc::new(FixedIndex(Err(IndexError::Unavailable("down".into())))),
            ContextConfig::default(),
        );
        let err = stage.retrieve(&intent(0.9)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::IndexUnavailable);
        assert!(err.is_transient());
    }
}
