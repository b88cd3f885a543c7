//! Retrieved and accumulated context.
//!
//! [`RetrievedContext`] is what the context stage hands downstream.
//! [`AccumulatedContext`] is the per-request memory owned by one conductor;
//! it only ever grows.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::intent::Intent;
use super::plan::Plan;
use super::validation::IssueHistory;

/// A retrieved snippet of project code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeChunk {
    pub path: String,
    /// First line of the snippet, 1-based.
    pub start_line: usize,
    /// Last line of the snippet, inclusive.
    pub end_line: usize,
    pub content: String,
    /// Relevance score reported by the index, 0.0-1.0.
    pub relevance: f32,
}

impl CodeChunk {
    pub fn new(path: impl Into<String>, start_line: usize, content: impl Into<String>) -> Self {
        let content = content.into();
        let lines = content.lines().count().max(1);
        Self {
            path: path.into(),
            start_line,
            end_line: start_line + lines - 1,
            content,
            relevance: 0.0,
        }
    }

    pub fn with_relevance(mut self, relevance: f32) -> Self {
        self.relevance = relevance;
        self
    }

    /// Identity used for union and de-duplication.
    pub fn key(&self) -> (&str, usize, usize) {
        (self.path.as_str(), self.start_line, self.end_line)
    }
}

/// Budget-limited bundle of chunks in descending relevance order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    pub chunks: Vec<CodeChunk>,
    pub tokens_used: usize,
    pub token_budget: usize,
    /// Set when the pipeline proceeds without any relevant context.
    pub starved: bool,
}

impl RetrievedContext {
    /// An explicitly empty context for the "proceed" starvation policy.
    pub fn starved(token_budget: usize) -> Self {
        Self {
            chunks: Vec::new(),
            tokens_used: 0,
            token_budget,
            starved: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Append a chunk surfaced by a later stage; existing chunks are kept.
    pub fn extend(&mut self, chunk: CodeChunk, tokens: usize) {
        if self.chunks.iter().any(|c| c.key() == chunk.key()) {
            return;
        }
        self.tokens_used += tokens;
        self.chunks.push(chunk);
    }

    /// Chunks belonging to one file, in retrieval order.
    pub fn chunks_for<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a CodeChunk> + 'a {
        self.chunks.iter().filter(move |c| c.path == path)
    }
}

/// A convention or choice accepted earlier in the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Dotted topic, e.g. `naming.functions`.
    pub topic: String,
    pub value: String,
    /// Plan step that established the decision.
    pub origin_step: String,
}

/// Cross-stage memory for a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccumulatedContext {
    pub request_id: Uuid,
    pub request: String,
    pub prior_summary: Option<String>,
    pub intent: Option<Intent>,
    pub plan: Option<Plan>,
    pub chunks: Vec<CodeChunk>,
    pub decisions: Vec<Decision>,
    pub issue_history: IssueHistory,
}

impl AccumulatedContext {
    pub fn new(request: impl Into<String>, prior_summary: Option<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            request: request.into(),
            prior_summary,
            intent: None,
            plan: None,
            chunks: Vec::new(),
            decisions: Vec::new(),
            issue_history: IssueHistory::default(),
        }
    }

    /// Chunks plus decisions. Never decreases.
    pub fn size(&self) -> usize {
        self.chunks.len() + self.decisions.len()
    }

    /// Union the given chunks into the context. Returns how many were new.
    pub fn absorb_chunks<'a, I>(&mut self, chunks: I) -> usize
    where
        I: IntoIterator<Item = &'a CodeChunk>,
    {
        let mut added = 0;
        for chunk in chunks {
            if !self.chunks.iter().any(|c| c.key() == chunk.key()) {
                self.chunks.push(chunk.clone());
                added += 1;
            }
        }
        added
    }

    /// Union a whole file read by a later stage. Blank files are skipped.
    /// Returns true if the file was new to the context.
    pub fn absorb_file(&mut self, path: &str, content: &str) -> bool {
        if content.trim().is_empty() {
            return false;
        }
        let chunk = CodeChunk::new(path, 1, content).with_relevance(1.0);
        self.absorb_chunks([&chunk]) > 0
    }

        /// Record a decision unless an identical one is already present.
    pub fn record_decision(&mut self, decision: Decision) -> bool {
        if self.decisions.contains(&decision) {
            return false;
        }
        self.decisions.push(decision);
        true
    }

    /// First accepted decision on a topic.
    pub fn decision(&self, topic: &str) -> Option<&Decision> {
        self.decisions.iter().find(|d| d.topic == topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_line_span() {
        let chunk = CodeChunk::new("src/lib.rs", 10, "a\nb\nc");
        assert_eq!(chunk.start_line, 10);
        assert_eq!(chunk.end_line, 12);
    }

    #[test]
    fn test_absorb_is_a_union() {
        let mut ctx = AccumulatedContext::new("req", None);
        let a = CodeChunk::new("a.rs", 1, "x");
        let b = CodeChunk::new("b.rs", 1, "y");

        assert_eq!(ctx.absorb_chunks([&a, &b]), 2);
        assert_eq!(ctx.absorb_chunks([&a]), 0);
        assert_eq!(ctx.size(), 2);
    }

    #[test]
    fn test_absorb_file_once() {
        let mut ctx = AccumulatedContext::new("req", None);
        assert!(ctx.absorb_file("src/main.rs", "fn main() {}\n"));
        assert!(!ctx.absorb_file("src/main.rs", "fn main() {}\n"));
        assert!(!ctx.absorb_file("src/empty.rs", "\n"));
        assert_eq!(ctx.chunks[0].end_line, 1);
        assert_eq!(ctx.size(), 1);
    }

    #[test]
    fn test_decisions_do_not_duplicate() {
        let mut ctx = AccumulatedContext::new("req", None);
        let d = Decision {
            topic: "naming.functions".into(),
            value: "snake_case".into(),
            origin_step: "s1".into(),
        };
        assert!(ctx.record_decision(d.clone()));
        assert!(!ctx.record_decision(d));
        assert_eq!(ctx.decision("naming.functions").map(|d| d.value.as_str()), Some("snake_case"));
    }

    #[test]
    fn test_retrieved_context_extend_skips_known_chunks() {
        let mut ctx = RetrievedContext::default();
        let chunk = CodeChunk::new("a.rs", 1, "fn a() {}");
        ctx.extend(chunk.clone(), 3);
        ctx.extend(chunk, 3);
        assert_eq!(ctx.chunks.len(), 1);
        assert_eq!(ctx.tokens_used, 3);
    }
}
