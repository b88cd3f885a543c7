//! Code index port - ranked retrieval of project code.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::errors::IndexError;
use crate::domain::models::{CodeChunk, Scope};

/// Query built from an intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexQuery {
    pub text: String,
    /// Entities that should weigh more than free text.
    pub terms: Vec<String>,
    /// Filter hint; indexes may ignore it.
    pub scope: Option<Scope>,
    pub limit: usize,
}

/// A chunk together with the index's relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: CodeChunk,
    pub score: f32,
}

#[async_trait]
pub trait CodeIndex: Send + Sync {
    /// Return candidates in the index's own ranking order.
    async fn search(&self, query: &IndexQuery) -> Result<Vec<ScoredChunk>, IndexError>;
}
