//! Pipeline state machine, per-run trace, metrics and the final result.
//!
//! The conductor walks the [`Phase`] graph below. Every transition is checked
//! with [`Phase::can_transition_to`] before it is taken.
//!
//! ```text
//! Intent -> Context -> Plan -> Execute -> Validate -> Complete
//!   |          |         |        |          |   ^
//!   |          |         |        |          v   |
//!   |          |         |        |        FixLoop --> Validate
//!   v          v         v        v          v
//! NeedsClarification   Failed  (from any non-terminal phase)
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::context::AccumulatedContext;
use super::execution::ExecutionResult;
use super::intent::Intent;
use super::validation::ValidationIssue;
use crate::domain::errors::AgentError;

/// The five reasoning stages, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Intent,
    Context,
    Plan,
    Execution,
    Validation,
}

impl StageId {
    pub const ALL: [Self; 5] = [
        Self::Intent,
        Self::Context,
        Self::Plan,
        Self::Execution,
        Self::Validation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intent => "intent",
            Self::Context => "context",
            Self::Plan => "plan",
            Self::Execution => "execution",
            Self::Validation => "validation",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "intent" => Some(Self::Intent),
            "context" => Some(Self::Context),
            "plan" | "planning" => Some(Self::Plan),
            "execution" | "execute" => Some(Self::Execution),
            "validation" | "validate" => Some(Self::Validation),
            _ => None,
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conductor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Intent,
    Context,
    Plan,
    Execute,
    Validate,
    FixLoop,
    Complete,
    Failed,
    NeedsClarification,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intent => "intent",
            Self::Context => "context",
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Validate => "validate",
            Self::FixLoop => "fix_loop",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::NeedsClarification => "needs_clarification",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::NeedsClarification)
    }

    /// Stage whose invocation this phase represents.
    pub fn stage(&self) -> Option<StageId> {
        match self {
            Self::Intent => Some(StageId::Intent),
            Self::Context => Some(StageId::Context),
            Self::Plan => Some(StageId::Plan),
            Self::Execute | Self::FixLoop => Some(StageId::Execution),
            Self::Validate => Some(StageId::Validation),
            Self::Complete | Self::Failed | Self::NeedsClarification => None,
        }
    }

    pub fn can_transition_to(&self, next: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == Self::Failed {
            return true;
        }
        match self {
            Self::Intent => matches!(next, Self::Context | Self::NeedsClarification),
            Self::Context => matches!(next, Self::Plan),
            Self::Plan => matches!(next, Self::Execute),
            Self::Execute => matches!(next, Self::Validate),
            Self::Validate => matches!(next, Self::FixLoop | Self::Complete),
            Self::FixLoop => matches!(next, Self::Validate | Self::Complete),
            Self::Complete | Self::Failed | Self::NeedsClarification => false,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider token counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Counters for one stage across a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageMetrics {
    /// Logical invocations by the conductor.
    pub invocations: u32,
    /// Attempts including retries.
    pub attempts: u32,
    pub failures: u32,
    pub total_latency_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub stages: BTreeMap<StageId, StageMetrics>,
    pub fix_iterations: u32,
    pub total_duration_ms: u64,
    /// Streaming events dropped because the consumer fell behind.
    pub dropped_stream_events: u64,
}

impl PipelineMetrics {
    pub fn stage_mut(&mut self, stage: StageId) -> &mut StageMetrics {
        self.stages.entry(stage).or_default()
    }

    pub fn stage(&self, stage: StageId) -> StageMetrics {
        self.stages.get(&stage).copied().unwrap_or_default()
    }

    pub fn total_usage(&self) -> TokenUsage {
        self.stages.values().fold(TokenUsage::default(), |mut acc, m| {
            acc.add(TokenUsage::new(m.input_tokens, m.output_tokens));
            acc
        })
    }
}

/// Status of a phase when a lifecycle event is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Started,
    Completed,
    Retrying,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
        }
    }
}

/// One stage attempt recorded for later replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub phase: Phase,
    pub stage: StageId,
    pub attempt: u32,
    pub iteration: Option<u32>,
    pub step_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: PhaseStatus,
    pub usage: TokenUsage,
    pub detail: Option<String>,
}

/// A phase change, as recorded in the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StageTrace {
    pub transitions: Vec<Transition>,
    pub entries: Vec<TraceEntry>,
}

impl StageTrace {
    /// Phases visited, in order, starting with the first source phase.
    pub fn phases(&self) -> Vec<Phase> {
        let mut phases = Vec::with_capacity(self.transitions.len() + 1);
        if let Some(first) = self.transitions.first() {
            phases.push(first.from);
        }
        phases.extend(self.transitions.iter().map(|t| t.to));
        phases
    }

    pub fn entries_for(&self, stage: StageId) -> impl Iterator<Item = &TraceEntry> {
        self.entries.iter().filter(move |e| e.stage == stage)
    }
}

/// Question surfaced to the caller instead of an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub question: String,
    pub reason: String,
    pub partial_intent: Option<Intent>,
}

/// Tagged outcome of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Completed {
        artifacts: Vec<ExecutionResult>,
        /// Minor issues left on the accepted artifacts.
        warnings: Vec<ValidationIssue>,
        written: bool,
    },
    /// Best-effort artifacts after the fix loop ran out of iterations.
    FixLoopExhausted {
        artifacts: Vec<ExecutionResult>,
        unresolved: Vec<ValidationIssue>,
        iterations: u32,
        /// `ValidationFailure` carrying the highest unresolved severity.
        diagnosis: AgentError,
    },
    NeedsClarification {
        request: ClarificationRequest,
    },
    Failed {
        error: AgentError,
    },
}

impl ProcessOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::FixLoopExhausted { .. } => "fix_loop_exhausted",
            Self::NeedsClarification { .. } => "needs_clarification",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn artifacts(&self) -> &[ExecutionResult] {
        match self {
            Self::Completed { artifacts, .. } | Self::FixLoopExhausted { artifacts, .. } => {
                artifacts
            }
            Self::NeedsClarification { .. } | Self::Failed { .. } => &[],
        }
    }

    pub fn error(&self) -> Option<&AgentError> {
        match self {
            Self::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Everything a request produced, including the context it accumulated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResult {
    pub request_id: Uuid,
    pub outcome: ProcessOutcome,
    pub context: AccumulatedContext,
    pub metrics: PipelineMetrics,
    pub trace: StageTrace,
    pub final_phase: Phase,
}

impl ProcessResult {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, ProcessOutcome::Completed { .. })
    }

    /// One-line summary usable as the next request's prior summary.
    pub fn summary(&self) -> String {
        let intent = self
            .context
            .intent
            .as_ref()
            .map_or_else(|| self.context.request.clone(), |i| i.summary.clone());
        let paths: Vec<&str> = self
            .outcome
            .artifacts()
            .iter()
            .map(|a| a.path.as_str())
            .collect();
        if paths.is_empty() {
            format!("{}: {}", self.outcome.label(), intent)
        } else {
            format!("{}: {} ({})", self.outcome.label(), intent, paths.join(", "))
        }
    }
}

/// Lifecycle and streaming events published to the event sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    PhaseChanged {
        request_id: Uuid,
        from: Phase,
        to: Phase,
    },
    Stage {
        request_id: Uuid,
        phase: Phase,
        stage: StageId,
        status: PhaseStatus,
        attempt: u32,
        duration_ms: u64,
        usage: TokenUsage,
        steps_completed: usize,
        steps_total: usize,
    },
    FixIteration {
        request_id: Uuid,
        iteration: u32,
        step_id: String,
        target_signature: String,
        open_issues: usize,
    },
    ContentChunk {
        request_id: Uuid,
        step_id: String,
        sequence: u64,
        delta: String,
    },
    Finished {
        request_id: Uuid,
        outcome: String,
        duration_ms: u64,
    },
}

impl PipelineEvent {
    pub fn request_id(&self) -> Uuid {
        match self {
            Self::PhaseChanged { request_id, .. }
            | Self::Stage { request_id, .. }
            | Self::FixIteration { request_id, .. }
            | Self::ContentChunk { request_id, .. }
            | Self::Finished { request_id, .. } => *request_id,
        }
    }

    pub fn is_content(&self) -> bool {
        matches!(self, Self::ContentChunk { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            Phase::Intent,
            Phase::Context,
            Phase::Plan,
            Phase::Execute,
            Phase::Validate,
            Phase::FixLoop,
            Phase::Validate,
            Phase::Complete,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!Phase::Intent.can_transition_to(Phase::Plan));
        assert!(!Phase::Context.can_transition_to(Phase::NeedsClarification));
        assert!(!Phase::Complete.can_transition_to(Phase::Failed));
        assert!(!Phase::Plan.can_transition_to(Phase::Intent));
    }

    #[test]
    fn test_any_active_phase_can_fail() {
        for phase in [Phase::Intent, Phase::Context, Phase::Plan, Phase::Execute, Phase::Validate, Phase::FixLoop] {
            assert!(phase.can_transition_to(Phase::Failed));
        }
    }

    #[test]
    fn test_stage_ids_are_ordered() {
        let mut ids = StageId::ALL.to_vec();
        ids.reverse();
        ids.sort();
        assert_eq!(ids, StageId::ALL.to_vec());
    }

    #[test]
    fn test_metrics_usage_totals() {
        let mut metrics = PipelineMetrics::default();
        metrics.stage_mut(StageId::Intent).input_tokens = 10;
        metrics.stage_mut(StageId::Plan).output_tokens = 5;
        assert_eq!(metrics.total_usage().total(), 15);
        assert_eq!(metrics.stage(StageId::Execution), StageMetrics::default());
    }

    #[test]
    fn test_metrics_serialize_with_stage_keys() {
        let mut metrics = PipelineMetrics::default();
        metrics.stage_mut(StageId::Context).invocations = 1;
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["stages"]["context"]["invocations"], 1);
    }
}
