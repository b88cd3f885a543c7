//! Execution results and the stylistic patterns they are generated against.

use serde::{Deserialize, Serialize};

use super::plan::ActionType;

/// Indentation used by a file or a sample of chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "width")]
pub enum IndentStyle {
    Spaces(u8),
    Tabs,
}

impl Default for IndentStyle {
    fn default() -> Self {
        Self::Spaces(4)
    }
}

impl IndentStyle {
    /// One level of indentation.
    pub fn unit(&self) -> String {
        match self {
            Self::Spaces(width) => " ".repeat(usize::from(*width)),
            Self::Tabs => "\t".to_string(),
        }
    }
}

/// Identifier casing convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingConvention {
    SnakeCase,
    CamelCase,
    PascalCase,
    ScreamingSnakeCase,
}

impl NamingConvention {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SnakeCase => "snake_case",
            Self::CamelCase => "camelCase",
            Self::PascalCase => "PascalCase",
            Self::ScreamingSnakeCase => "SCREAMING_SNAKE_CASE",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "snake_case" => Some(Self::SnakeCase),
            "camelCase" => Some(Self::CamelCase),
            "PascalCase" => Some(Self::PascalCase),
            "SCREAMING_SNAKE_CASE" => Some(Self::ScreamingSnakeCase),
            _ => None,
        }
    }

    /// Classify an identifier. Single-word lowercase names are snake_case;
    /// names that fit no convention return `None`.
    pub fn classify(ident: &str) -> Option<Self> {
        let ident = ident.trim_start_matches('_');
        let first = ident.chars().next()?;
        let has_underscore = ident.contains('_');
        let has_lower = ident.chars().any(|c| c.is_ascii_lowercase());
        let has_upper = ident.chars().any(|c| c.is_ascii_uppercase());

        if !has_lower && has_upper {
            return Some(Self::ScreamingSnakeCase);
        }
        if first.is_ascii_uppercase() && !has_underscore {
            return Some(Self::PascalCase);
        }
        if first.is_ascii_lowercase() {
            if has_upper && !has_underscore {
                return Some(Self::CamelCase);
            }
            if !has_upper {
                return Some(Self::SnakeCase);
            }
        }
        None
    }

    /// Whether two conventions can describe the same identifier.
    pub fn compatible_with(&self, ident: &str) -> bool {
        match Self::classify(ident) {
            Some(found) => found == *self,
            None => true,
        }
    }
}

impl std::fmt::Display for NamingConvention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStyle {
    Double,
    Single,
}

/// Stylistic and structural patterns mined from existing code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CodePatterns {
    pub indent: IndentStyle,
    pub function_naming: Option<NamingConvention>,
    pub type_naming: Option<NamingConvention>,
    pub quote_style: Option<QuoteStyle>,
    pub trailing_newline: bool,
    /// Number of chunks/files the patterns were mined from.
    pub sample_size: usize,
}

/// Short audit record of the reasoning behind a change. Never validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReasoningTrace {
    pub goal: String,
    pub constraints: Vec<String>,
    pub approach: String,
}

/// The strategy that located a splice point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpliceStrategy {
    /// Exact, unique match of the original snippet.
    ExactMatch,
    /// A unique anchor line.
    Anchor,
    /// Windowed longest-common-subsequence alignment.
    Alignment,
    /// Minimal changed span between the old and a rewritten file.
    DiffSpan,
    /// Whole new file.
    NewFile,
}

/// Lines replaced by an edit, in the original content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditSpan {
    /// First replaced line, 0-based.
    pub start: usize,
    /// One past the last replaced line.
    pub end: usize,
    /// Number of lines inserted in place of the span.
    pub inserted: usize,
    pub strategy: SpliceStrategy,
}

impl EditSpan {
    pub fn removed(&self) -> usize {
        self.end - self.start
    }
}

/// Generated or modified content for one plan step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub step_id: String,
    pub path: String,
    pub action: ActionType,
    /// Repository content before the pipeline touched the file.
    pub original_content: Option<String>,
    pub new_content: String,
    /// Unified diff against `original_content`.
    pub diff: String,
    pub edit_span: Option<EditSpan>,
    pub patterns: CodePatterns,
    pub reasoning: Option<ReasoningTrace>,
    /// 1 for the first execution of the step, incremented per fix attempt.
    pub attempt: u32,
}
