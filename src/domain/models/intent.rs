//! Intent domain model.
//!
//! The structured interpretation of a change request. Created once per
//! request by the intent stage and never mutated afterwards.

use serde::{Deserialize, Serialize};

/// Kind of change the request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Feature,
    BugFix,
    Refactor,
    Test,
    Documentation,
    Configuration,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::BugFix => "bug_fix",
            Self::Refactor => "refactor",
            Self::Test => "test",
            Self::Documentation => "documentation",
            Self::Configuration => "configuration",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace(['-', ' '], "_").as_str() {
            "feature" => Some(Self::Feature),
            "bug_fix" | "bugfix" | "fix" => Some(Self::BugFix),
            "refactor" => Some(Self::Refactor),
            "test" | "tests" => Some(Self::Test),
            "documentation" | "docs" => Some(Self::Documentation),
            "configuration" | "config" => Some(Self::Configuration),
            _ => None,
        }
    }
}

/// How much of the project the change is expected to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[default]
    SingleFile,
    MultiFile,
    Module,
    ProjectWide,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleFile => "single_file",
            Self::MultiFile => "multi_file",
            Self::Module => "module",
            Self::ProjectWide => "project_wide",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace(['-', ' '], "_").as_str() {
            "single_file" | "file" => Some(Self::SingleFile),
            "multi_file" => Some(Self::MultiFile),
            "module" => Some(Self::Module),
            "project_wide" | "project" => Some(Self::ProjectWide),
            _ => None,
        }
    }
}

/// Urgency of the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" | "medium" => Some(Self::Normal),
            "high" => Some(Self::High),
            "critical" | "urgent" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Structured interpretation of a change request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub task_type: TaskType,
    pub scope: Scope,
    pub priority: Priority,
    /// Identifiers, paths and concepts named by the request.
    pub entities: Vec<String>,
    /// Provider confidence in this interpretation, clamped to 0.0-1.0.
    pub confidence: f32,
    /// One-sentence restatement of the request.
    pub summary: String,
    pub needs_clarification: bool,
    pub clarifying_question: Option<String>,
}

impl Intent {
    /// Build the index query text for this intent.
    pub fn query_text(&self) -> String {
        if self.entities.is_empty() {
            return self.summary.clone();
        }
        format!("{} {}", self.summary, self.entities.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_aliases() {
        assert_eq!(TaskType::from_str("Bug-Fix"), Some(TaskType::BugFix));
        assert_eq!(TaskType::from_str("docs"), Some(TaskType::Documentation));
        assert_eq!(TaskType::from_str("migration"), None);
    }

    #[test]
    fn test_query_text_includes_entities() {
        let intent = Intent {
            task_type: TaskType::Feature,
            scope: Scope::SingleFile,
            priority: Priority::Normal,
            entities: vec!["UserService".into(), "src/user.rs".into()],
            confidence: 0.9,
            summary: "add email validation".into(),
            needs_clarification: false,
            clarifying_question: None,
        };
        assert_eq!(intent.query_text(), "add email validation UserService src/user.rs");
    }
}
