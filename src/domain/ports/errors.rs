use thiserror::Error;

use crate::domain::errors::{AgentError, ErrorKind, Severity};
use crate::domain::models::StageId;

/// Generative provider errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Provider timed out after {0}ms")]
    Timeout(u64),

    #[error("Provider rate limited{}", .retry_after_ms.map(|ms| format!(", retry after {ms}ms")).unwrap_or_default())]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Provider output did not match schema: {0}")]
    SchemaParseFailure(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::RateLimited { .. })
    }

    /// Classify into the pipeline taxonomy on behalf of `stage`.
    pub fn into_agent_error(self, stage: StageId) -> AgentError {
        let message = self.to_string();
        match self {
            Self::Timeout(_) | Self::RateLimited { .. } => {
                AgentError::new(stage, ErrorKind::ProviderTransient, message)
            }
            Self::SchemaParseFailure(_) => {
                AgentError::new(stage, ErrorKind::SchemaParseFailure, message)
            }
            // Unavailable providers are not retried.
            Self::Unavailable(_) => AgentError::new(stage, ErrorKind::ProviderTransient, message)
                .with_severity(Severity::Fatal),
        }
    }
}

/// Code index errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("Code index unavailable: {0}")]
    Unavailable(String),
}

impl IndexError {
    pub fn into_agent_error(self, stage: StageId) -> AgentError {
        AgentError::new(stage, ErrorKind::IndexUnavailable, self.to_string())
    }
}

/// Repository accessor errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("Path escapes repository root: {0}")]
    OutsideRoot(String),
}

impl RepositoryError {
    pub fn into_agent_error(self, stage: StageId) -> AgentError {
        AgentError::new(stage, ErrorKind::RepositoryAccess, self.to_string())
    }
}

/// History store errors
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("History I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("History serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
