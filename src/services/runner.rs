//! Request entry point: history in, conductor run, history out.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::models::{Config, ProcessResult};
use crate::domain::ports::{EventSink, HistoryStore, RepositoryAccessor};
use crate::services::conductor::Conductor;
use crate::services::stage::StageSet;

/// Runs requests against a shared stage set. Each request gets its own
/// conductor, so concurrent `process` calls share nothing mutable.
#[derive(Clone)]
pub struct PipelineRunner {
    stages: StageSet,
    config: Arc<Config>,
    events: Arc<dyn EventSink>,
    history: Arc<dyn HistoryStore>,
    repository: Option<Arc<dyn RepositoryAccessor>>,
}

impl PipelineRunner {
    pub fn new(
        stages: StageSet,
        config: Arc<Config>,
        events: Arc<dyn EventSink>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            stages,
            config,
            events,
            history,
            repository: None,
        }
    }

    pub fn with_repository(mut self, repository: Arc<dyn RepositoryAccessor>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Process one request within a conversation. History failures are
    /// logged and never change the outcome.
    pub async fn process(
        &self,
        conversation_id: &str,
        request: &str,
        cancel: CancellationToken,
    ) -> ProcessResult {
        self.process_with_summary(conversation_id, request, None, cancel)
            .await
    }

    /// Like [`process`](Self::process), but a given summary replaces the
    /// one stored for the conversation.
    pub async fn process_with_summary(
        &self,
        conversation_id: &str,
        request: &str,
        summary: Option<String>,
        cancel: CancellationToken,
    ) -> ProcessResult {
        let prior_summary = match summary {
            Some(summary) => Some(summary),
            None => match self.history.load_summary(conversation_id).await {
                Ok(summary) => summary,
                Err(err) => {
                    warn!(conversation_id, error = %err, "failed to load conversation summary");
                    None
                }
            },
        };

        let mut conductor = Conductor::new(self.stages.clone(), self.config.clone(), self.events.clone());
        if let Some(repository) = &self.repository {
            conductor = conductor.with_repository(repository.clone());
        }
        let result = conductor.run(request, prior_summary, cancel).await;

        if let Err(err) = self.history.store(conversation_id, &result).await {
            warn!(conversation_id, request_id = %result.request_id, error = %err, "failed to store result");
        }
        result
    }
}
