//! Validation issues, their signatures, and the cross-iteration history.
//!
//! A signature is a stable hash of category, location and normalized
//! message. The [`IssueHistory`] keyed by signature is what lets the fix
//! loop tell a recurrence from a new issue, and an oscillation (a fix that
//! brings back what it was meant to remove) from an issue that is simply
//! still open.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Fixed issue taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Syntax,
    Completeness,
    Consistency,
    Contradiction,
    Correctness,
    Style,
}

impl IssueCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Completeness => "completeness",
            Self::Consistency => "consistency",
            Self::Contradiction => "contradiction",
            Self::Correctness => "correctness",
            Self::Style => "style",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "syntax" => Some(Self::Syntax),
            "completeness" | "omission" => Some(Self::Completeness),
            "consistency" => Some(Self::Consistency),
            "contradiction" => Some(Self::Contradiction),
            "correctness" | "logic" => Some(Self::Correctness),
            "style" => Some(Self::Style),
            _ => None,
        }
    }
}

/// Severity of a validation issue. Ordered: `Blocking` is the greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Minor,
    Major,
    Blocking,
}

impl IssueSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minor => "minor",
            Self::Major => "major",
            Self::Blocking => "blocking",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "minor" | "low" | "info" => Some(Self::Minor),
            "major" | "medium" | "warning" => Some(Self::Major),
            "blocking" | "critical" | "high" | "error" => Some(Self::Blocking),
            _ => None,
        }
    }

    /// Issues at this severity keep the fix loop running.
    pub fn is_actionable(&self) -> bool {
        *self >= Self::Major
    }
}

impl std::fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which validation tier produced an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckTier {
    Quick,
    Deep,
}

/// One detected problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub step_id: String,
    pub category: IssueCategory,
    pub severity: IssueSeverity,
    pub location: Option<String>,
    pub message: String,
    pub signature: String,
    /// The signature was already in the history when this issue was seen.
    pub recurrence: bool,
    pub tier: CheckTier,
}

impl ValidationIssue {
    pub fn new(
        step_id: impl Into<String>,
        category: IssueCategory,
        severity: IssueSeverity,
        location: Option<String>,
        message: impl Into<String>,
        tier: CheckTier,
    ) -> Self {
        let message = message.into();
        let signature = issue_signature(category, location.as_deref(), &message);
        Self {
            step_id: step_id.into(),
            category,
            severity,
            location,
            message,
            signature,
            recurrence: false,
            tier,
        }
    }
}

/// Stable signature: SHA-256 over `category|location|normalized message`,
/// truncated to 16 hex characters.
pub fn issue_signature(category: IssueCategory, location: Option<&str>, message: &str) -> String {
    let normalized = message
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let mut hasher = Sha256::new();
    hasher.update(category.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(location.unwrap_or("").trim().as_bytes());
    hasher.update(b"|");
    hasher.update(normalized.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// Output of one validation run for one execution result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ValidationResult {
    pub issues: Vec<ValidationIssue>,
    /// The quick tier found a blocking problem and the deep tier was skipped.
    pub short_circuited: bool,
}

impl ValidationResult {
    pub fn actionable(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity.is_actionable())
    }

    pub fn has_actionable(&self) -> bool {
        self.actionable().next().is_some()
    }

    pub fn max_severity(&self) -> Option<IssueSeverity> {
        self.issues.iter().map(|i| i.severity).max()
    }
}

/// Lifecycle of a signature across fix iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    /// A fix attempt was aimed at this issue.
    Targeted,
    /// The issue was absent from a later validation of its step.
    Resolved,
}

/// History entry for one signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub step_id: String,
    pub severity: IssueSeverity,
    pub message: String,
    pub first_seen_iteration: u32,
    pub last_seen_iteration: u32,
    pub occurrences: u32,
    pub status: IssueStatus,
}

/// How a freshly validated issue relates to what has been seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    New,
    /// Seen before and never addressed.
    StillOpen,
    /// Came back after being targeted by a fix or after being resolved.
    Reappeared(IssueStatus),
}

impl Observation {
    pub fn is_oscillation(&self) -> bool {
        matches!(self, Self::Reappeared(_))
    }
}

/// Signature history for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IssueHistory {
    records: BTreeMap<String, IssueRecord>,
}

impl IssueHistory {
    pub fn contains(&self, signature: &str) -> bool {
        self.records.contains_key(signature)
    }

    pub fn get(&self, signature: &str) -> Option<&IssueRecord> {
        self.records.get(signature)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record an issue seen at `iteration`, flag it as a recurrence if the
    /// signature is known, and classify the observation.
    pub fn observe(&mut self, issue: &mut ValidationIssue, iteration: u32) -> Observation {
        if let Some(record) = self.records.get_mut(&issue.signature) {
            issue.recurrence = true;
            let previous = record.status;
            record.occurrences += 1;
            record.last_seen_iteration = iteration;
            record.status = IssueStatus::Open;
            return match previous {
                IssueStatus::Open => Observation::StillOpen,
                other => Observation::Reappeared(other),
            };
        }

        self.records.insert(
            issue.signature.clone(),
            IssueRecord {
                step_id: issue.step_id.clone(),
                severity: issue.severity,
                message: issue.message.clone(),
                first_seen_iteration: iteration,
                last_seen_iteration: iteration,
                occurrences: 1,
                status: IssueStatus::Open,
            },
        );
        Observation::New
    }

    pub fn mark_targeted(&mut self, signature: &str) {
        if let Some(record) = self.records.get_mut(signature) {
            record.status = IssueStatus::Targeted;
        }
    }

    /// Resolve every unresolved issue of `step_id` absent from `seen`.
    pub fn resolve_absent(&mut self, step_id: &str, seen: &HashSet<String>) -> usize {
        let mut resolved = 0;
        for (signature, record) in &mut self.records {
            if record.step_id == step_id
                && record.status != IssueStatus::Resolved
                && !seen.contains(signature)
            {
                record.status = IssueStatus::Resolved;
                resolved += 1;
            }
        }
        resolved
    }

    pub fn recurring(&self) -> impl Iterator<Item = (&String, &IssueRecord)> {
        self.records.iter().filter(|(_, r)| r.occurrences > 1)
    }
}
