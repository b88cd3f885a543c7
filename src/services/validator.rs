//! Validation stage: two-tier checking of one execution result.
//!
//! The quick tier is local and cheap. A blocking finding there ends the
//! validation without running the deep tier, which compares the result with
//! the conventions accepted earlier in the run and, optionally, asks the
//! provider for a review.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{debug, info};

use crate::domain::errors::AgentResult;
use crate::domain::models::{
    CheckTier, Decision, ExecutionResult, IssueCategory, IssueHistory, IssueSeverity,
    NamingConvention, StageId, ValidationConfig, ValidationIssue, ValidationResult,
};
use crate::domain::ports::{GenerativeProvider, ProviderRequest};
use crate::services::pattern_extractor::PatternExtractor;
use crate::services::stage::{Stage, StageContext, StageOutcome, ValidationInput};

const SYSTEM_PROMPT: &str = "You review a single generated code change. Report only concrete \
problems: incorrect logic, missing pieces the step requires, and inconsistencies with the \
related code. Do not report style preferences.";

/// Decision topic for function naming.
pub const TOPIC_FUNCTION_NAMING: &str = "naming.functions";
/// Decision topic for type naming.
pub const TOPIC_TYPE_NAMING: &str = "naming.types";

const PLACEHOLDERS: [&str; 3] = ["todo!()", "unimplemented!()", "raise NotImplementedError"];

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ReviewResponse {
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ReviewIssue {
    pub category: String,
    pub severity: String,
    #[serde(default)]
    pub location: Option<String>,
    pub message: String,
}

pub struct ValidationStage {
    provider: Arc<dyn GenerativeProvider>,
    config: ValidationConfig,
    extractor: PatternExtractor,
}

impl ValidationStage {
    pub fn new(provider: Arc<dyn GenerativeProvider>, config: ValidationConfig) -> Self {
        Self {
            provider,
            config,
            extractor: PatternExtractor::new(),
        }
    }

    pub async fn validate(
        &self,
        result: &ExecutionResult,
        decisions: &[Decision],
        history: &IssueHistory,
        ctx: &StageContext,
    ) -> AgentResult<ValidationResult> {
        let mut issues = quick_checks(result);
        let short_circuited = issues.iter().any(|i| i.severity == IssueSeverity::Blocking);

        if short_circuited {
            debug!(step_id = %result.step_id, "blocking quick-tier issue, deep tier skipped");
        } else {
            issues.extend(self.convention_checks(result, decisions));
            if self.config.deep_review {
                issues.extend(self.review(result, ctx).await?);
            }
        }

        let mut seen = HashSet::new();
        issues.retain(|issue| seen.insert(issue.signature.clone()));
        for issue in &mut issues {
            issue.recurrence = history.contains(&issue.signature);
        }

        let validation = ValidationResult {
            issues,
            short_circuited,
        };
        info!(
            step_id = %result.step_id,
            issues = validation.issues.len(),
            actionable = validation.actionable().count(),
            max_severity = validation.max_severity().map(|s| s.as_str()),
            short_circuited,
            "result validated"
        );
        Ok(validation)
    }

    /// Naming in identifiers this result introduced, against the result's
    /// own patterns and against accepted decisions.
    fn convention_checks(&self, result: &ExecutionResult, decisions: &[Decision]) -> Vec<ValidationIssue> {
        let original = result.original_content.as_deref().unwrap_or("");
        let known_fns: HashSet<String> = self.extractor.function_names(original).into_iter().collect();
        let known_types: HashSet<String> = self.extractor.type_names(original).into_iter().collect();

        let new_fns: Vec<String> = unique(self.extractor.function_names(&result.new_content))
            .into_iter()
            .filter(|n| !known_fns.contains(n))
            .collect();
        let new_types: Vec<String> = unique(self.extractor.type_names(&result.new_content))
            .into_iter()
            .filter(|n| !known_types.contains(n))
            .collect();

        let mut issues = Vec::new();
        let groups = [
            ("function", &new_fns, result.patterns.function_naming, TOPIC_FUNCTION_NAMING),
            ("type", &new_types, result.patterns.type_naming, TOPIC_TYPE_NAMING),
        ];
        for (kind, names, local, topic) in groups {
            let accepted = decisions.iter().find(|d| d.topic == topic && d.origin_step != result.step_id);
            let accepted_convention = accepted.and_then(|d| NamingConvention::from_str(&d.value));

            for name in names {
                if let Some(expected) = local {
                    if !expected.compatible_with(name) {
                        issues.push(ValidationIssue::new(
                            &result.step_id,
                            IssueCategory::Style,
                            IssueSeverity::Minor,
                            Some(result.path.clone()),
                            format!("{kind} `{name}` is not {expected}"),
                            CheckTier::Deep,
                        ));
                    }
                }
                if let (Some(decision), Some(expected)) = (accepted, accepted_convention) {
                    if !expected.compatible_with(name) {
                        issues.push(ValidationIssue::new(
                            &result.step_id,
                            IssueCategory::Contradiction,
                            IssueSeverity::Major,
                            Some(result.path.clone()),
                            format!(
                                "{kind} `{name}` contradicts {topic} = {} accepted in step {}",
                                decision.value, decision.origin_step
                            ),
                            CheckTier::Deep,
                        ));
                    }
                }
            }
        }
        issues
    }

    async fn review(&self, result: &ExecutionResult, ctx: &StageContext) -> AgentResult<Vec<ValidationIssue>> {
        let prompt = format!(
            "## Step {}\nFile: {}\n\n## Diff\n{}\n\n## Resulting content\n{}\n\n\
             Respond with issues (category syntax|completeness|consistency|contradiction|correctness|style, \
             severity minor|major|blocking, location, message). Return an empty list when the change is sound.",
            result.step_id, result.path, result.diff, result.new_content
        );
        let request =
            ProviderRequest::new(StageId::Validation, SYSTEM_PROMPT, prompt).expecting::<ReviewResponse>();

        let response = tokio::select! {
            () = ctx.cancel.cancelled() => {
                return Err(crate::domain::errors::AgentError::cancelled(StageId::Validation));
            }
            response = self.provider.generate(request) => {
                response.map_err(|e| e.into_agent_error(StageId::Validation))?
            }
        };
        ctx.record_usage(response.usage);

        let parsed: ReviewResponse = response
            .parse()
            .map_err(|e| e.into_agent_error(StageId::Validation))?;
        Ok(parsed
            .issues
            .into_iter()
            .filter(|i| !i.message.trim().is_empty())
            .map(|i| {
                ValidationIssue::new(
                    &result.step_id,
                    IssueCategory::from_str(&i.category).unwrap_or(IssueCategory::Correctness),
                    IssueSeverity::from_str(&i.severity).unwrap_or(IssueSeverity::Major),
                    i.location.or_else(|| Some(result.path.clone())),
                    i.message.trim(),
                    CheckTier::Deep,
                )
            })
            .collect())
    }
}

/// Conventions a clean result establishes for later steps.
pub fn established_decisions(result: &ExecutionResult) -> Vec<Decision> {
    let mut decisions = Vec::new();
    if let Some(naming) = result.patterns.function_naming {
        decisions.push(Decision {
            topic: TOPIC_FUNCTION_NAMING.to_string(),
            value: naming.as_str().to_string(),
            origin_step: result.step_id.clone(),
        });
    }
    if let Some(naming) = result.patterns.type_naming {
        decisions.push(Decision {
            topic: TOPIC_TYPE_NAMING.to_string(),
            value: naming.as_str().to_string(),
            origin_step: result.step_id.clone(),
        });
    }
    decisions
}

fn unique(names: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names.into_iter().filter(|n| seen.insert(n.clone())).collect()
}

/// Local structural checks.
pub fn quick_checks(result: &ExecutionResult) -> Vec<ValidationIssue> {
    let issue = |category, severity, message: String| {
        ValidationIssue::new(
            &result.step_id,
            category,
            severity,
            Some(result.path.clone()),
            message,
            CheckTier::Quick,
        )
    };

    let content = &result.new_content;
    if content.trim().is_empty() {
        return vec![issue(
            IssueCategory::Completeness,
            IssueSeverity::Blocking,
            "file is empty".to_string(),
        )];
    }

    let mut issues = Vec::new();

    if content.lines().any(is_conflict_marker) {
        issues.push(issue(
            IssueCategory::Syntax,
            IssueSeverity::Blocking,
            "merge conflict markers left in file".to_string(),
        ));
    }

    if let Err(e) = check_delimiters(content, Lexicon::for_path(&result.path)) {
        debug!(path = %result.path, line = e.line(), "delimiter check failed");
        issues.push(issue(IssueCategory::Syntax, IssueSeverity::Blocking, e.message()));
    }

    for placeholder in PLACEHOLDERS {
        if content.contains(placeholder) {
            issues.push(issue(
                IssueCategory::Completeness,
                IssueSeverity::Major,
                format!("placeholder `{placeholder}` left in code"),
            ));
        }
    }
    if content
        .lines()
        .map(str::trim)
        .any(|l| matches!(l, "// ..." | "# ..." | "/* ... */" | "..."))
    {
        issues.push(issue(
            IssueCategory::Completeness,
            IssueSeverity::Major,
            "elided code left in file".to_string(),
        ));
    }

    issues
}

fn is_conflict_marker(line: &str) -> bool {
    line.starts_with("<<<<<<< ") || line.starts_with(">>>>>>> ") || line == "======="
}

/// How a single quote is lexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SingleQuote {
    /// Char literal, or a lifetime when unterminated.
    Char,
    /// String delimiter.
    Str,
}

/// Comment and string syntax of a source language, as far as bracket
/// matching needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lexicon {
    slash_comments: bool,
    hash_comments: bool,
    single_quote: SingleQuote,
    backtick_strings: bool,
}

impl Lexicon {
    const C_LIKE: Self = Self {
        slash_comments: true,
        hash_comments: false,
        single_quote: SingleQuote::Char,
        backtick_strings: false,
    };
    const GO: Self = Self {
        backtick_strings: true,
        ..Self::C_LIKE
    };
    const SCRIPT: Self = Self {
        slash_comments: true,
        hash_comments: false,
        single_quote: SingleQuote::Str,
        backtick_strings: true,
    };
    const PHP: Self = Self {
        hash_comments: true,
        backtick_strings: false,
        ..Self::SCRIPT
    };
    const HASH: Self = Self {
        slash_comments: false,
        hash_comments: true,
        single_quote: SingleQuote::Str,
        backtick_strings: false,
    };

    fn for_path(path: &str) -> Self {
        let ext = path.rsplit_once('.').map_or("", |(_, ext)| ext);
        match ext {
            "go" => Self::GO,
            "js" | "jsx" | "mjs" | "cjs" | "ts" | "tsx" => Self::SCRIPT,
            "php" => Self::PHP,
            "py" | "rb" | "sh" | "bash" | "toml" | "yaml" | "yml" | "pl" | "r" => Self::HASH,
            _ => Self::C_LIKE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DelimiterError {
    Unexpected { found: char, line: usize },
    Mismatched { open: char, found: char, line: usize },
    Unclosed { open: char, line: usize },
}

impl DelimiterError {
    fn line(&self) -> usize {
        match self {
            Self::Unexpected { line, .. } | Self::Mismatched { line, .. } | Self::Unclosed { line, .. } => *line,
        }
    }

    /// Line numbers stay out of the message so the issue signature survives
    /// edits elsewhere in the file.
    fn message(&self) -> String {
        match self {
            Self::Unexpected { found, .. } => format!("unbalanced delimiters: unexpected '{found}'"),
            Self::Mismatched { open, found, .. } => {
                format!("unbalanced delimiters: '{found}' closes '{open}'")
            }
            Self::Unclosed { open, .. } => format!("unbalanced delimiters: unclosed '{open}'"),
        }
    }
}

/// Bracket balance outside string literals and comments.
fn check_delimiters(content: &str, lexicon: Lexicon) -> Result<(), DelimiterError> {
    let chars: Vec<char> = content.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1;
    let mut i = 0;

    let skip_string = |i: &mut usize, line: &mut usize, quote: char| {
        *i += 1;
        while *i < chars.len() && chars[*i] != quote {
            match chars[*i] {
                '\\' => *i += 1,
                '\n' => *line += 1,
                _ => {}
            }
            *i += 1;
        }
    };
    let skip_line = |i: &mut usize| {
        while *i + 1 < chars.len() && chars[*i + 1] != '\n' {
            *i += 1;
        }
    };

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\n' => line += 1,
            '/' if lexicon.slash_comments && next == Some('/') => skip_line(&mut i),
            '#' if lexicon.hash_comments => skip_line(&mut i),
            '/' if lexicon.slash_comments && next == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            '"' => skip_string(&mut i, &mut line, '"'),
            '`' if lexicon.backtick_strings => skip_string(&mut i, &mut line, '`'),
            '\'' if lexicon.single_quote == SingleQuote::Str => skip_string(&mut i, &mut line, '\''),
            '\'' => {
                // Char literal; a bare quote is a lifetime.
                if next == Some('\\') {
                    if let Some(end) = (i + 2..chars.len().min(i + 12)).find(|&j| chars[j] == '\'') {
                        i = end;
                    }
                } else if chars.get(i + 2) == Some(&'\'') {
                    i += 2;
                }
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    None => return Err(DelimiterError::Unexpected { found: c, line }),
                    Some((open, _)) if open != expected => {
                        return Err(DelimiterError::Mismatched { open, found: c, line })
                    }
                    Some(_) => {}
                }
            }
            _ => {}
        }
        i += 1;
    }

    match stack.pop() {
        Some((open, line)) => Err(DelimiterError::Unclosed { open, line }),
        None => Ok(()),
    }
}

#[async_trait]
impl Stage for ValidationStage {
    type Input = ValidationInput;
    type Output = ValidationResult;

    fn id(&self) -> StageId {
        StageId::Validation
    }

    async fn run(&self, input: &ValidationInput, ctx: &StageContext) -> StageOutcome<ValidationResult> {
        self.validate(&input.result, &input.decisions, &input.history, ctx)
            .await
            .into()
    }
}
