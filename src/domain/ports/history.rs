use async_trait::async_trait;

use super::errors::HistoryError;
use crate::domain::models::ProcessResult;

/// Conversation history boundary.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Summary of the conversation so far, if any.
    async fn load_summary(&self, conversation_id: &str) -> Result<Option<String>, HistoryError>;

    /// Store the final result, including its per-stage trace.
    async fn store(&self, conversation_id: &str, result: &ProcessResult) -> Result<(), HistoryError>;
}
