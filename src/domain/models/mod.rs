pub mod config;
pub mod context;
pub mod execution;
pub mod intent;
pub mod pipeline;
pub mod plan;
pub mod validation;

pub use config::{
    Config, ContextConfig, ContextStarvedPolicy, ExecutionConfig, FixLoopConfig, IntentConfig,
    LoggingConfig, PipelineConfig, PlanningConfig, RetryConfig, StreamingConfig, ValidationConfig,
};
pub use context::{AccumulatedContext, CodeChunk, Decision, RetrievedContext};
pub use execution::{
    CodePatterns, EditSpan, ExecutionResult, IndentStyle, NamingConvention, QuoteStyle,
    ReasoningTrace, SpliceStrategy,
};
pub use intent::{Intent, Priority, Scope, TaskType};
pub use pipeline::{
    ClarificationRequest, Phase, PhaseStatus, PipelineEvent, PipelineMetrics, ProcessOutcome,
    ProcessResult, StageId, StageMetrics, StageTrace, TokenUsage, TraceEntry, Transition,
};
pub use plan::{ActionType, OrderingViolation, Plan, PlanStep, RiskLevel, StepCategory};
pub use validation::{
    issue_signature, CheckTier, IssueCategory, IssueHistory, IssueRecord, IssueSeverity,
    IssueStatus, Observation, ValidationIssue, ValidationResult,
};
