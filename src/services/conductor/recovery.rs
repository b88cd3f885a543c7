//! Severity-driven recovery decisions.

use crate::domain::errors::{AgentError, ErrorKind, Severity};
use crate::domain::models::{ClarificationRequest, Intent, ProcessOutcome};

/// What the conductor does with a failed stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Back off and call the same stage again.
    Retry,
    /// Handled by the phase: re-generation, starvation policy or fix loop.
    Local,
    /// Stop and ask the caller.
    Clarify,
    /// Abort the request.
    Abort,
}

/// Recovery for an error given whether the retry budget allows another try.
pub fn recovery_for(err: &AgentError, can_retry: bool) -> Recovery {
    match err.severity {
        Severity::Transient if can_retry => Recovery::Retry,
        Severity::Transient => Recovery::Abort,
        Severity::Recoverable => Recovery::Local,
        Severity::NeedsClarification => Recovery::Clarify,
        Severity::Fatal => Recovery::Abort,
    }
}

/// Why a phase stopped the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Halt {
    Clarify(ClarificationRequest),
    Fail(AgentError),
}

impl Halt {
    /// Terminal outcome. Any error still below Fatal here had no local
    /// recovery left and is escalated.
    pub fn into_outcome(self) -> ProcessOutcome {
        match self {
            Self::Clarify(request) => ProcessOutcome::NeedsClarification { request },
            Self::Fail(err) if err.severity == Severity::NeedsClarification => {
                ProcessOutcome::NeedsClarification {
                    request: clarification_from_error(&err, None),
                }
            }
            Self::Fail(err) if err.is_fatal() => ProcessOutcome::Failed { error: err },
            Self::Fail(err) => ProcessOutcome::Failed {
                error: err.escalate("no local recovery left"),
            },
        }
    }

    pub fn error(&self) -> Option<&AgentError> {
        match self {
            Self::Fail(err) => Some(err),
            Self::Clarify(_) => None,
        }
    }
}

impl From<AgentError> for Halt {
    fn from(err: AgentError) -> Self {
        if err.severity == Severity::NeedsClarification {
            Self::Clarify(clarification_from_error(&err, None))
        } else {
            Self::Fail(err)
        }
    }
}

pub fn clarification_from_error(err: &AgentError, partial_intent: Option<Intent>) -> ClarificationRequest {
    let question = match err.kind {
        ErrorKind::ClarificationNeeded if err.message.contains("empty") => {
            "What change would you like to make?".to_string()
        }
        _ => format!("Could you clarify the request? {}", err.message),
    };
    ClarificationRequest {
        question,
        reason: err.message.clone(),
        partial_intent,
    }
}

/// Clarification for an intent the intent stage flagged.
pub fn clarification_for_intent(intent: Intent, threshold: f32) -> ClarificationRequest {
    let reason = if intent.confidence < threshold {
        format!(
            "intent confidence {:.2} is below threshold {:.2}",
            intent.confidence, threshold
        )
    } else {
        "request contains contradictory statements".to_string()
    };
    ClarificationRequest {
        question: intent
            .clarifying_question
            .clone()
            .unwrap_or_else(|| format!("Could you clarify: \"{}\"?", intent.summary)),
        reason,
        partial_intent: Some(intent),
    }
}
