use crate::domain::models::PipelineEvent;

/// Receives lifecycle and streaming events.
///
/// `emit` is called inline from the pipeline and must return promptly:
/// implementations queue, log or drop, but never wait on a consumer.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}
