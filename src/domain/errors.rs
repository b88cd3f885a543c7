//! Domain errors for the conductor pipeline.
//!
//! Every stage failure is an [`AgentError`]: a taxonomy [`ErrorKind`], a
//! recovery-relevant [`Severity`] and the [`StageId`] that raised it. The
//! conductor's recovery logic dispatches on severity; the kind is kept for
//! diagnosis and for the few policies that are kind-specific.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::models::{IssueSeverity, StageId};

/// Recovery-relevant classification of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Retry the same stage with backoff.
    Transient,
    /// Recover locally via re-generation or the fix loop.
    Recoverable,
    /// Abort the pipeline.
    Fatal,
    /// Halt and ask the caller for more input.
    NeedsClarification,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Recoverable => "recoverable",
            Self::Fatal => "fatal",
            Self::NeedsClarification => "needs_clarification",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Provider timeout or rate limit.
    ProviderTransient,
    /// Provider output did not match the expected schema.
    SchemaParseFailure,
    /// No chunk met the relevance floor.
    InsufficientContext,
    /// Plan steps violate category precedence or dependency order.
    PlanOrderingViolation,
    /// Validation found actionable issues of the given severity.
    ValidationFailure(IssueSeverity),
    /// A fix attempt reproduced a targeted or resolved issue.
    ContradictionDetected,
    /// The request is too ambiguous or contradictory to act on.
    ClarificationNeeded,
    /// The fix loop ran out of iterations.
    FixLoopExhausted,
    /// The caller cancelled the request.
    Cancelled,
    /// The code index could not be queried.
    IndexUnavailable,
    /// Reading or writing the repository failed.
    RepositoryAccess,
    /// No splice point could be located for a modification.
    SpliceNotFound,
}

impl ErrorKind {
    /// Severity assigned when a stage raises this kind without an override.
    pub fn default_severity(&self) -> Severity {
        match self {
            Self::ProviderTransient | Self::IndexUnavailable => Severity::Transient,
            Self::SchemaParseFailure
            | Self::InsufficientContext
            | Self::PlanOrderingViolation
            | Self::ValidationFailure(_)
            | Self::SpliceNotFound => Severity::Recoverable,
            Self::ClarificationNeeded => Severity::NeedsClarification,
            Self::ContradictionDetected
            | Self::FixLoopExhausted
            | Self::Cancelled
            | Self::RepositoryAccess => Severity::Fatal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProviderTransient => "provider_transient",
            Self::SchemaParseFailure => "schema_parse_failure",
            Self::InsufficientContext => "insufficient_context",
            Self::PlanOrderingViolation => "plan_ordering_violation",
            Self::ValidationFailure(_) => "validation_failure",
            Self::ContradictionDetected => "contradiction_detected",
            Self::ClarificationNeeded => "clarification_needed",
            Self::FixLoopExhausted => "fix_loop_exhausted",
            Self::Cancelled => "cancelled",
            Self::IndexUnavailable => "index_unavailable",
            Self::RepositoryAccess => "repository_access",
            Self::SpliceNotFound => "splice_not_found",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ValidationFailure(severity) => write!(f, "validation_failure({severity})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Typed failure raised by a stage call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{stage} stage failed ({kind}, {severity}): {message}")]
pub struct AgentError {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub stage: StageId,
    pub message: String,
}

impl AgentError {
    /// Create an error with the kind's default severity.
    pub fn new(stage: StageId, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            stage,
            message: message.into(),
        }
    }

    pub fn cancelled(stage: StageId) -> Self {
        Self::new(stage, ErrorKind::Cancelled, "request cancelled")
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Promote to Fatal, recording why.
    pub fn escalate(mut self, reason: impl std::fmt::Display) -> Self {
        self.severity = Severity::Fatal;
        self.message = format!("{}; escalated: {}", self.message, reason);
        self
    }

    pub fn is_transient(&self) -> bool {
        self.severity == Severity::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}

pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_severities() {
        assert_eq!(ErrorKind::ProviderTransient.default_severity(), Severity::Transient);
        assert_eq!(ErrorKind::IndexUnavailable.default_severity(), Severity::Transient);
        assert_eq!(
            ErrorKind::PlanOrderingViolation.default_severity(),
            Severity::Recoverable
        );
        assert_eq!(
            ErrorKind::ClarificationNeeded.default_severity(),
            Severity::NeedsClarification
        );
        assert_eq!(ErrorKind::Cancelled.default_severity(), Severity::Fatal);
    }

    #[test]
    fn test_escalate_keeps_kind_and_stage() {
        let err = AgentError::new(StageId::Plan, ErrorKind::PlanOrderingViolation, "bad order")
            .escalate("second violation");

        assert!(err.is_fatal());
        assert_eq!(err.kind, ErrorKind::PlanOrderingViolation);
        assert_eq!(err.stage, StageId::Plan);
        assert!(err.message.contains("second violation"));
    }

    #[test]
    fn test_display_includes_stage_and_kind() {
        let err = AgentError::new(
            StageId::Validation,
            ErrorKind::ValidationFailure(IssueSeverity::Major),
            "2 issues",
        );
        let rendered = err.to_string();
        assert!(rendered.contains("validation"));
        assert!(rendered.contains("validation_failure(major)"));
    }
}
