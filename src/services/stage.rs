//! Uniform stage interface and the stage registry.
//!
//! Every stage is called with a borrowed input so the conductor can re-run
//! it on retry, and returns an explicit [`StageOutcome`] instead of
//! unwinding through errors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::errors::{AgentError, AgentResult};
use crate::domain::models::{
    ClarificationRequest, Decision, ExecutionResult, Intent, IssueHistory, Plan, PlanStep,
    RetrievedContext, StageId, TokenUsage, ValidationIssue, ValidationResult,
};
use crate::domain::ports::EventSink;

/// Result of one stage call.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome<T> {
    Done(T),
    /// The stage cannot proceed without more input from the caller.
    NeedsInput(ClarificationRequest),
    Failed(AgentError),
}

impl<T> StageOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StageOutcome<U> {
        match self {
            Self::Done(value) => StageOutcome::Done(f(value)),
            Self::NeedsInput(request) => StageOutcome::NeedsInput(request),
            Self::Failed(err) => StageOutcome::Failed(err),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    pub fn error(&self) -> Option<&AgentError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl<T> From<AgentResult<T>> for StageOutcome<T> {
    fn from(result: AgentResult<T>) -> Self {
        match result {
            Ok(value) => Self::Done(value),
            Err(err) => Self::Failed(err),
        }
    }
}

/// Per-request services handed to every stage call.
pub struct StageContext {
    pub request_id: Uuid,
    pub cancel: CancellationToken,
    pub events: Arc<dyn EventSink>,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl StageContext {
    pub fn new(request_id: Uuid, cancel: CancellationToken, events: Arc<dyn EventSink>) -> Self {
        Self {
            request_id,
            cancel,
            events,
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
        }
    }

    /// Add provider usage to the current attempt.
    pub fn record_usage(&self, usage: TokenUsage) {
        self.input_tokens.fetch_add(usage.input_tokens, Ordering::Relaxed);
        self.output_tokens.fetch_add(usage.output_tokens, Ordering::Relaxed);
    }

    /// Usage recorded since the last call, resetting the counters.
    pub fn take_usage(&self) -> TokenUsage {
        TokenUsage::new(
            self.input_tokens.swap(0, Ordering::Relaxed),
            self.output_tokens.swap(0, Ordering::Relaxed),
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    type Input: Send + Sync;
    type Output: Send;

    fn id(&self) -> StageId;

    async fn run(&self, input: &Self::Input, ctx: &StageContext) -> StageOutcome<Self::Output>;
}

#[derive(Debug, Clone)]
pub struct IntentInput {
    pub request: String,
    pub prior_summary: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlanInput {
    pub intent: Intent,
    pub context: Arc<RetrievedContext>,
    /// Why the previous plan was rejected.
    pub feedback: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionInput {
    pub step: PlanStep,
    pub context: Arc<RetrievedContext>,
    pub decisions: Vec<Decision>,
    /// Issues the next attempt must resolve. Empty on first execution.
    pub prior_issues: Vec<ValidationIssue>,
    /// Result being fixed; its content is the base for the next edit.
    pub previous: Option<ExecutionResult>,
    /// Latest result of another step on the same file. When set, its
    /// content is the base instead of the repository or `previous`.
    pub predecessor: Option<ExecutionResult>,
    /// Why the previous attempt was rejected.
    pub feedback: Option<String>,
}

impl ExecutionInput {
    pub fn new(step: PlanStep, context: Arc<RetrievedContext>, decisions: Vec<Decision>) -> Self {
        Self {
            step,
            context,
            decisions,
            prior_issues: Vec::new(),
            previous: None,
            predecessor: None,
            feedback: None,
        }
    }

    pub fn after(mut self, predecessor: Option<ExecutionResult>) -> Self {
        self.predecessor = predecessor;
        self
    }

    pub fn is_fix(&self) -> bool {
        !self.prior_issues.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ValidationInput {
    pub result: ExecutionResult,
    pub context: Arc<RetrievedContext>,
    pub decisions: Vec<Decision>,
    pub history: IssueHistory,
}

pub type DynIntentStage = Arc<dyn Stage<Input = IntentInput, Output = Intent>>;
pub type DynContextStage = Arc<dyn Stage<Input = Intent, Output = RetrievedContext>>;
pub type DynPlanStage = Arc<dyn Stage<Input = PlanInput, Output = Plan>>;
pub type DynExecutionStage = Arc<dyn Stage<Input = ExecutionInput, Output = ExecutionResult>>;
pub type DynValidationStage = Arc<dyn Stage<Input = ValidationInput, Output = ValidationResult>>;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("stage registered as {expected} reports id {actual}")]
pub struct StageMismatch {
    pub expected: StageId,
    pub actual: StageId,
}

/// The five stages, resolved once and shared by every conductor.
#[derive(Clone)]
pub struct StageSet {
    intent: DynIntentStage,
    context: DynContextStage,
    plan: DynPlanStage,
    execution: DynExecutionStage,
    validation: DynValidationStage,
}

impl StageSet {
    pub fn new(
        intent: DynIntentStage,
        context: DynContextStage,
        plan: DynPlanStage,
        execution: DynExecutionStage,
        validation: DynValidationStage,
    ) -> Result<Self, StageMismatch> {
        let registered = [
            (StageId::Intent, intent.id()),
            (StageId::Context, context.id()),
            (StageId::Plan, plan.id()),
            (StageId::Execution, execution.id()),
            (StageId::Validation, validation.id()),
        ];
        for (expected, actual) in registered {
            if expected != actual {
                return Err(StageMismatch { expected, actual });
            }
        }

        Ok(Self {
            intent,
            context,
            plan,
            execution,
            validation,
        })
    }

    pub fn intent(&self) -> &DynIntentStage {
        &self.intent
    }

    pub fn context(&self) -> &DynContextStage {
        &self.context
    }

    pub fn plan(&self) -> &DynPlanStage {
        &self.plan
    }

    pub fn execution(&self) -> &DynExecutionStage {
        &self.execution
    }

    pub fn validation(&self) -> &DynValidationStage {
        &self.validation
    }

    pub fn with_execution(mut self, execution: DynExecutionStage) -> Result<Self, StageMismatch> {
        if execution.id() != StageId::Execution {
            return Err(StageMismatch {
                expected: StageId::Execution,
                actual: execution.id(),
            });
        }
        self.execution = execution;
        Ok(self)
    }
}
