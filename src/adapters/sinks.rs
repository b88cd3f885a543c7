//! Event sink adapters.

use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::domain::models::{PhaseStatus, PipelineEvent};
use crate::domain::ports::EventSink;

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: PipelineEvent) {}
}

/// Renders lifecycle events as log records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::PhaseChanged {
                request_id,
                from,
                to,
            } => info!(%request_id, from = from.as_str(), to = to.as_str(), "phase changed"),
            PipelineEvent::Stage {
                request_id,
                phase,
                stage,
                status,
                attempt,
                duration_ms,
                usage,
                steps_completed,
                steps_total,
            } => {
                if matches!(status, PhaseStatus::Failed | PhaseStatus::Retrying) {
                    warn!(
                        %request_id,
                        phase = phase.as_str(),
                        stage = stage.as_str(),
                        status = status.as_str(),
                        attempt,
                        duration_ms,
                        "stage attempt did not complete"
                    );
                } else {
                    info!(
                        %request_id,
                        phase = phase.as_str(),
                        stage = stage.as_str(),
                        status = status.as_str(),
                        attempt,
                        duration_ms,
                        tokens = usage.total(),
                        steps_completed,
                        steps_total,
                        "stage"
                    );
                }
            }
            PipelineEvent::FixIteration {
                request_id,
                iteration,
                step_id,
                target_signature,
                open_issues,
            } => info!(
                %request_id,
                iteration,
                step_id = %step_id,
                target = %target_signature,
                open_issues,
                "fix iteration"
            ),
            PipelineEvent::ContentChunk {
                request_id,
                step_id,
                sequence,
                delta,
            } => debug!(%request_id, step_id = %step_id, sequence, bytes = delta.len(), "content chunk"),
            PipelineEvent::Finished {
                request_id,
                outcome,
                duration_ms,
            } => info!(%request_id, outcome = %outcome, duration_ms, "request finished"),
        }
    }
}

/// Keeps every event in memory. Used by tests and the CLI's JSON output.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Streamed content, concatenated in sequence order.
    pub fn content(&self) -> String {
        let mut chunks: Vec<(u64, String)> = self
            .events()
            .into_iter()
            .filter_map(|e| match e {
                PipelineEvent::ContentChunk { sequence, delta, .. } => Some((sequence, delta)),
                _ => None,
            })
            .collect();
        chunks.sort_by_key(|(sequence, _)| *sequence);
        chunks.into_iter().map(|(_, delta)| delta).collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: PipelineEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Fans one event out to several sinks.
pub struct FanoutEventSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: PipelineEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn test_recording_sink_content_is_ordered() {
        let sink = RecordingEventSink::new();
        for (sequence, delta) in [(1, "b"), (0, "a"), (2, "c")] {
            sink.emit(PipelineEvent::ContentChunk {
                request_id: Uuid::nil(),
                step_id: "s".into(),
                sequence,
                delta: delta.into(),
            });
        }
        assert_eq!(sink.content(), "abc");
        assert_eq!(sink.events().len(), 3);
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(RecordingEventSink::new());
        let b = Arc::new(RecordingEventSink::new());
        let fanout = FanoutEventSink::new(vec![a.clone(), b.clone(), Arc::new(NullEventSink)]);
        fanout.emit(PipelineEvent::Finished {
            request_id: Uuid::nil(),
            outcome: "completed".into(),
            duration_ms: 1,
        });
        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events().len(), 1);
    }
}
