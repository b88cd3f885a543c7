//! Execution stage: produces file content for one plan step.
//!
//! New files are synthesized from scratch and conformed to the patterns
//! mined from the most relevant chunks. Existing files are changed through a
//! single localized edit located by [`PrecisionEditor`]. The base for the
//! edit is the latest content of the file in this run: an earlier step's
//! output on the same path, the result being fixed, or the repository file.
//! The diff is always taken against the repository's original content.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::errors::{AgentError, AgentResult, ErrorKind};
use crate::domain::models::{
    ActionType, CodePatterns, EditSpan, ExecutionConfig, ExecutionResult, IndentStyle,
    PipelineEvent, ReasoningTrace, SpliceStrategy, StageId,
};
use crate::domain::ports::{GenerativeProvider, ProviderRequest, ProviderResponse, RepositoryAccessor};
use crate::services::pattern_extractor::{conform, PatternExtractor};
use crate::services::precision_edit::{unified_diff, EditInstruction, PrecisionEditor};
use crate::services::stage::{ExecutionInput, Stage, StageContext, StageOutcome};

const SYSTEM_PROMPT: &str = "You implement one planned code change at a time. First state \
the goal, the constraints you must respect and the approach you chose. Then produce the \
change. For an existing file, return the smallest edit that achieves the step and leave \
every unrelated line untouched. Follow the conventions of the surrounding code.";

/// Deltas buffered between the provider and the event forwarder.
const DELTA_BUFFER: usize = 64;

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ReasoningResponse {
    pub goal: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub approach: String,
}

/// Shape the provider must return. New files use `content`; existing files
/// use `edit`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExecutionResponse {
    #[serde(default)]
    pub reasoning: Option<ReasoningResponse>,
    #[serde(default)]
    pub edit: Option<EditInstruction>,
    #[serde(default)]
    pub content: Option<String>,
}

pub struct ExecutionStage {
    provider: Arc<dyn GenerativeProvider>,
    repository: Arc<dyn RepositoryAccessor>,
    config: ExecutionConfig,
    extractor: PatternExtractor,
    editor: PrecisionEditor,
}

impl ExecutionStage {
    pub fn new(
        provider: Arc<dyn GenerativeProvider>,
        repository: Arc<dyn RepositoryAccessor>,
        config: ExecutionConfig,
    ) -> Self {
        let editor = PrecisionEditor::new(config.alignment_threshold);
        Self {
            provider,
            repository,
            config,
            extractor: PatternExtractor::new(),
            editor,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.config.streaming
    }

    pub async fn execute(&self, input: &ExecutionInput, ctx: &StageContext) -> AgentResult<ExecutionResult> {
        let step = &input.step;
        let path = step
            .primary_target()
            .ok_or_else(|| schema_error(format!("step '{}' has no target file", step.id)))?
            .to_string();

        let original = self
            .repository
            .read_optional(&path)
            .await
            .map_err(|e| e.into_agent_error(StageId::Execution))?;

        let latest = input.predecessor.as_ref().or(input.previous.as_ref());
        let base = match (latest, &original) {
            (Some(latest), _) => Some(latest.new_content.clone()),
            (None, Some(content)) => Some(content.clone()),
            (None, None) if step.action == ActionType::Modify => {
                return Err(AgentError::new(
                    StageId::Execution,
                    ErrorKind::RepositoryAccess,
                    format!("step '{}' modifies missing file {path}", step.id),
                ));
            }
            (None, None) => None,
        };

        let samples: Vec<&str> = input
            .context
            .chunks
            .iter()
            .take(self.config.pattern_sample_chunks)
            .map(|c| c.content.as_str())
            .collect();
        let patterns = self.extractor.extract(samples, base.as_deref());

        let prompt = build_prompt(input, &path, &patterns, base.as_deref());
        let request = ProviderRequest::new(StageId::Execution, SYSTEM_PROMPT, prompt)
            .expecting::<ExecutionResponse>();

        let response = self.generate(request, &step.id, ctx).await?;
        ctx.record_usage(response.usage);
        let parsed: ExecutionResponse = response
            .parse()
            .map_err(|e| e.into_agent_error(StageId::Execution))?;

        let reasoning = parsed.reasoning.map(|r| ReasoningTrace {
            goal: r.goal,
            constraints: r.constraints,
            approach: r.approach,
        });
        if let Some(reasoning) = &reasoning {
            debug!(step_id = %step.id, goal = %reasoning.goal, "execution reasoning");
        }

        let (new_content, edit_span) = match base.as_deref() {
            None => {
                let content = match (parsed.content, parsed.edit) {
                    (Some(content), _) | (None, Some(EditInstruction::Rewrite { content })) => content,
                    _ => return Err(schema_error(format!("no content for new file {path}"))),
                };
                let content = conform(&content, &patterns);
                let span = EditSpan {
                    start: 0,
                    end: 0,
                    inserted: content.lines().count(),
                    strategy: SpliceStrategy::NewFile,
                };
                (content, span)
            }
            Some(base) => {
                let edit = match (parsed.edit, parsed.content) {
                    (Some(edit), _) => edit,
                    (None, Some(content)) => EditInstruction::Rewrite { content },
                    (None, None) => return Err(schema_error(format!("no edit for {path}"))),
                };
                let splice = self.editor.apply(base, &edit).map_err(|e| {
                    warn!(step_id = %step.id, path = %path, error = %e, "splice point not found");
                    AgentError::new(StageId::Execution, ErrorKind::SpliceNotFound, format!("{path}: {e}"))
                })?;
                (splice.content, splice.span)
            }
        };

        let diff = unified_diff(&path, original.as_deref(), &new_content);
        let attempt = input.previous.as_ref().map_or(1, |p| p.attempt + 1);

        info!(
            step_id = %step.id,
            path = %path,
            attempt,
            strategy = ?edit_span.strategy,
            removed = edit_span.removed(),
            inserted = edit_span.inserted,
            fix = input.is_fix(),
            "step executed"
        );

        Ok(ExecutionResult {
            step_id: step.id.clone(),
            path,
            action: step.action,
            original_content: original,
            new_content,
            diff,
            edit_span: Some(edit_span),
            patterns,
            reasoning,
            attempt,
        })
    }

    /// One provider call, observing cancellation. In streaming mode deltas
    /// are forwarded as content events while generation runs; a cancelled
    /// stream discards everything received so far.
    async fn generate(
        &self,
        request: ProviderRequest,
        step_id: &str,
        ctx: &StageContext,
    ) -> AgentResult<ProviderResponse> {
        if !self.config.streaming {
            return tokio::select! {
                () = ctx.cancel.cancelled() => Err(AgentError::cancelled(StageId::Execution)),
                result = self.provider.generate(request) => {
                    result.map_err(|e| e.into_agent_error(StageId::Execution))
                }
            };
        }

        let started = Instant::now();
        let (deltas_tx, mut deltas_rx) = mpsc::channel::<String>(DELTA_BUFFER);
        let generation = self.provider.generate_streaming(request, deltas_tx);
        let forward = async {
            let mut sequence = 0u64;
            while let Some(delta) = deltas_rx.recv().await {
                ctx.events.emit(PipelineEvent::ContentChunk {
                    request_id: ctx.request_id,
                    step_id: step_id.to_string(),
                    sequence,
                    delta,
                });
                sequence += 1;
            }
            sequence
        };

        tokio::select! {
            () = ctx.cancel.cancelled() => {
                warn!(step_id, "generation cancelled, partial output discarded");
                Err(AgentError::cancelled(StageId::Execution))
            }
            (result, chunks) = async { tokio::join!(generation, forward) } => {
                debug!(step_id, chunks, elapsed_ms = started.elapsed().as_millis() as u64, "stream finished");
                result.map_err(|e| e.into_agent_error(StageId::Execution))
            }
        }
    }

}

/// Latest result per path, in order of first appearance. Later steps on a
/// path build on earlier ones, so the last result holds the file's content.
pub fn final_contents(results: &[ExecutionResult]) -> Vec<&ExecutionResult> {
    let mut latest: Vec<&ExecutionResult> = Vec::new();
    for result in results {
        match latest.iter_mut().find(|r| r.path == result.path) {
            Some(slot) => *slot = result,
            None => latest.push(result),
        }
    }
    latest
}

/// Write the final content of each touched file. Stops at the first
/// failure. Returns the number of files written.
pub async fn write_artifacts(
    repository: &dyn RepositoryAccessor,
    results: &[ExecutionResult],
) -> AgentResult<usize> {
    let files = final_contents(results);
    for result in &files {
        repository
            .write(&result.path, &result.new_content)
            .await
            .map_err(|e| e.into_agent_error(StageId::Execution))?;
    }
    info!(files = files.len(), steps = results.len(), "artifacts written");
    Ok(files.len())
}

fn schema_error(message: String) -> AgentError {
    AgentError::new(StageId::Execution, ErrorKind::SchemaParseFailure, message)
}

fn build_prompt(
    input: &ExecutionInput,
    path: &str,
    patterns: &CodePatterns,
    base: Option<&str>,
) -> String {
    let step = &input.step;
    let mut prompt = format!(
        "## Step {} ({})\n{}\nFile: {path}\n\n## Conventions\nIndent: {}\n",
        step.id,
        step.category.as_str(),
        step.description,
        match patterns.indent {
            IndentStyle::Spaces(w) => format!("{w} spaces"),
            IndentStyle::Tabs => "tabs".to_string(),
        },
    );
    if let Some(naming) = patterns.function_naming {
        let _ = writeln!(prompt, "Function names: {naming}");
    }
    if let Some(naming) = patterns.type_naming {
        let _ = writeln!(prompt, "Type names: {naming}");
    }
    for decision in &input.decisions {
        let _ = writeln!(prompt, "Accepted: {} = {}", decision.topic, decision.value);
    }

    prompt.push_str("\n## Related code\n");
    if input.context.chunks.is_empty() {
        prompt.push_str("None.\n");
    }
    for chunk in input.context.chunks.iter().filter(|c| c.path != path) {
        let _ = writeln!(prompt, "### {}:{}\n{}\n", chunk.path, chunk.start_line, chunk.content);
    }

    match base {
        Some(content) => {
            let _ = write!(
                prompt,
                "\n## Current content of {path}\n{content}\n\nReturn reasoning and an edit: \
                 replace {{original, replacement}}, insert {{anchor, position before|after, content}} \
                 or rewrite {{content}}.\n"
            );
        }
        None => {
            prompt.push_str("\nThe file does not exist yet. Return reasoning and the full content.\n");
        }
    }

    if input.is_fix() {
        prompt.push_str("\n## Issues to resolve\nResolve exactly these issues and keep all other content as it is.\n");
        for issue in &input.prior_issues {
            let _ = writeln!(
                prompt,
                "- [{} {}] {}{}",
                issue.severity,
                issue.category.as_str(),
                issue
                    .location
                    .as_deref()
                    .map(|l| format!("{l}: "))
                    .unwrap_or_default(),
                issue.message
            );
        }
    }
    if let Some(feedback) = &input.feedback {
        let _ = write!(prompt, "\n## Previous attempt was rejected\n{feedback}\n");
    }
    prompt
}

#[async_trait]
impl Stage for ExecutionStage {
    type Input = ExecutionInput;
    type Output = ExecutionResult;

    fn id(&self) -> StageId {
        StageId::Execution
    }

    async fn run(&self, input: &ExecutionInput, ctx: &StageContext) -> StageOutcome<ExecutionResult> {
        self.execute(input, ctx).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::providers::ScriptedProvider;
    use crate::adapters::repository::MemoryRepository;
    use crate::adapters::sinks::RecordingEventSink;
    use crate::domain::models::{
        CheckTier, IssueCategory, IssueSeverity, RetrievedContext, StepCategory, ValidationIssue,
    };
    use crate::test_support::{chunk, stage_ctx, step};
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    const EXISTING: &str = "fn main() {\n    let config = load();\n    run(config);\n}\n";

    fn context() -> Arc<RetrievedContext> {
        Arc::new(RetrievedContext {
            chunks: vec![chunk(
                "src/lib.rs",
                1,
                "pub fn parse_input(raw: &str) -> Input {\n  Input::new(raw)\n}\n",
                0.9,
            )],
            tokens_used: 10,
            token_budget: 100,
            starved: false,
        })
    }

    fn stage(provider: Arc<ScriptedProvider>, repo: Arc<MemoryRepository>) -> ExecutionStage {
        ExecutionStage::new(provider, repo, ExecutionConfig::default())
    }

    #[tokio::test]
    async fn test_modify_produces_minimal_span() {
        let provider = Arc::new(ScriptedProvider::new());
        provider
            .push_output(
                StageId::Execution,
                json!({
                    "reasoning": {"goal": "propagate errors", "constraints": ["keep signature"], "approach": "use ?"},
                    "edit": {"kind": "replace", "original": "run(config);", "replacement": "run(config)?;"}
                }),
            )
            .await;
        let repo = Arc::new(MemoryRepository::with_files([("src/main.rs", EXISTING)]));
        let input = ExecutionInput::new(
            step("s1", StepCategory::CoreLogic, ActionType::Modify, "src/main.rs"),
            context(),
            Vec::new(),
        );

        let result = stage(provider, repo).execute(&input, &stage_ctx()).await.unwrap();
        let span = result.edit_span.unwrap();
        assert_eq!((span.start, span.removed(), span.inserted), (2, 1, 1));
        assert_eq!(result.diff.lines().filter(|l| l.starts_with('-') && !l.starts_with("---")).count(), 1);
        assert_eq!(result.original_content.as_deref(), Some(EXISTING));
        assert_eq!(result.reasoning.unwrap().goal, "propagate errors");
        assert_eq!(result.attempt, 1);
    }

    #[tokio::test]
    async fn test_create_conforms_to_patterns() {
        let provider = Arc::new(ScriptedProvider::new());
        provider
            .push_output(
                StageId::Execution,
                json!({"content": "pub fn build_input() -> Input {\n    Input::default()\n}"}),
            )
            .await;
        let input = ExecutionInput::new(
            step("s1", StepCategory::CoreLogic, ActionType::Create, "src/input.rs"),
            context(),
            Vec::new(),
        );

        let result = stage(provider, Arc::new(MemoryRepository::new()))
            .execute(&input, &stage_ctx())
            .await
            .unwrap();
        assert_eq!(result.patterns.indent, IndentStyle::Spaces(2));
        assert_eq!(result.new_content, "pub fn build_input() -> Input {\n  Input::default()\n}\n");
        assert_eq!(result.edit_span.unwrap().strategy, SpliceStrategy::NewFile);
        assert!(result.diff.starts_with("--- /dev/null"));
    }

    #[tokio::test]
    async fn test_fix_edits_previous_content_and_diffs_original() {
        let provider = Arc::new(ScriptedProvider::new());
        provider
            .push_output(
                StageId::Execution,
                json!({"edit": {"kind": "replace", "original": "todo!()", "replacement": "load_default()"}}),
            )
            .await;
        let repo = Arc::new(MemoryRepository::with_files([("src/main.rs", EXISTING)]));
        let execution = stage(provider.clone(), repo);

        let previous = ExecutionResult {
            step_id: "s1".into(),
            path: "src/main.rs".into(),
            action: ActionType::Modify,
            original_content: Some(EXISTING.into()),
            new_content: EXISTING.replace("load()", "todo!()"),
            diff: String::new(),
            edit_span: None,
            patterns: CodePatterns::default(),
            reasoning: None,
            attempt: 1,
        };
        let mut input = ExecutionInput::new(
            step("s1", StepCategory::CoreLogic, ActionType::Modify, "src/main.rs"),
            context(),
            Vec::new(),
        );
        input.prior_issues = vec![ValidationIssue::new(
            "s1",
            IssueCategory::Completeness,
            IssueSeverity::Major,
            Some("src/main.rs".into()),
            "placeholder body",
            CheckTier::Quick,
        )];
        input.previous = Some(previous);

        let result = execution.execute(&input, &stage_ctx()).await.unwrap();
        assert!(result.new_content.contains("load_default()"));
        assert!(result.diff.contains("-    let config = load();"));
        assert_eq!(result.attempt, 2);

        let prompt = &provider.requests(StageId::Execution).await[0].user_prompt;
        assert!(prompt.contains("Issues to resolve"));
        assert!(prompt.contains("placeholder body"));
    }

    #[tokio::test]
    async fn test_unlocatable_edit_is_recoverable() {
        let provider = Arc::new(ScriptedProvider::new());
        provider
            .push_output(
                StageId::Execution,
                json!({"edit": {"kind": "replace", "original": "not in the file", "replacement": "x"}}),
            )
            .await;
        let repo = Arc::new(MemoryRepository::with_files([("src/main.rs", EXISTING)]));
        let input = ExecutionInput::new(
            step("s1", StepCategory::CoreLogic, ActionType::Modify, "src/main.rs"),
            context(),
            Vec::new(),
        );

        let err = stage(provider, repo).execute(&input, &stage_ctx()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SpliceNotFound);
        assert_eq!(err.severity, crate::domain::errors::Severity::Recoverable);
    }

    #[tokio::test]
    async fn test_streaming_forwards_deltas() {
        let provider = Arc::new(ScriptedProvider::new().with_streaming(8, Duration::ZERO));
        let output = json!({"content": "fn a() {}\n"});
        provider.push_output(StageId::Execution, output.clone()).await;
        let sink = Arc::new(RecordingEventSink::new());
        let ctx = StageContext::new(Uuid::new_v4(), CancellationToken::new(), sink.clone());
        let execution = ExecutionStage::new(
            provider,
            Arc::new(MemoryRepository::new()),
            ExecutionConfig {
                streaming: true,
                ..ExecutionConfig::default()
            },
        );
        let input = ExecutionInput::new(
            step("s1", StepCategory::CoreLogic, ActionType::Create, "src/a.rs"),
            context(),
            Vec::new(),
        );

        execution.execute(&input, &ctx).await.unwrap();
        assert!(sink.events().len() > 1);
        assert_eq!(sink.content(), output.to_string());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_stream_discards_output() {
        let provider = Arc::new(ScriptedProvider::new().with_streaming(1, Duration::from_millis(50)));
        provider.push_output(StageId::Execution, json!({"content": "fn a() {}\n"})).await;
        let cancel = CancellationToken::new();
        let ctx = StageContext::new(Uuid::new_v4(), cancel.clone(), Arc::new(RecordingEventSink::new()));
        let execution = ExecutionStage::new(
            provider,
            Arc::new(MemoryRepository::new()),
            ExecutionConfig {
                streaming: true,
                ..ExecutionConfig::default()
            },
        );
        let input = ExecutionInput::new(
            step("s1", StepCategory::CoreLogic, ActionType::Create, "src/a.rs"),
            context(),
            Vec::new(),
        );

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            cancel.cancel();
        });
        let err = execution.execute(&input, &ctx).await.unwrap_err();
        canceller.await.unwrap();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_step_builds_on_earlier_step_for_same_file() {
        let provider = Arc::new(ScriptedProvider::new());
        provider
            .push_output(
                StageId::Execution,
                json!({"edit": {"kind": "replace", "original": "run(config);", "replacement": "run(config)?;"}}),
            )
            .await;
        let repo = Arc::new(MemoryRepository::with_files([("src/main.rs", EXISTING)]));
        let earlier = ExecutionResult {
            step_id: "s1".into(),
            path: "src/main.rs".into(),
            action: ActionType::Modify,
            original_content: Some(EXISTING.into()),
            new_content: EXISTING.replace("load()", "load()?"),
            diff: String::new(),
            edit_span: None,
            patterns: CodePatterns::default(),
            reasoning: None,
            attempt: 1,
        };
        let input = ExecutionInput::new(
            step("s2", StepCategory::CoreLogic, ActionType::Modify, "src/main.rs"),
            context(),
            Vec::new(),
        )
        .after(Some(earlier));

        let result = stage(provider, repo).execute(&input, &stage_ctx()).await.unwrap();
        assert_eq!(
            result.new_content,
            "fn main() {\n    let config = load()?;\n    run(config)?;\n}\n"
        );
        assert_eq!(result.original_content.as_deref(), Some(EXISTING));
        assert!(result.diff.contains("-    let config = load();"));
        assert!(result.diff.contains("-    run(config);"));
        assert_eq!(result.attempt, 1);
    }

    #[tokio::test]
    async fn test_modify_after_create_in_same_run() {
        let provider = Arc::new(ScriptedProvider::new());
        provider
            .push_output(
                StageId::Execution,
                json!({"edit": {"kind": "replace", "original": "fn a() {}", "replacement": "pub fn a() {}"}}),
            )
            .await;
        let created = ExecutionResult {
            step_id: "s1".into(),
            path: "src/a.rs".into(),
            action: ActionType::Create,
            original_content: None,
            new_content: "fn a() {}\n".into(),
            diff: String::new(),
            edit_span: None,
            patterns: CodePatterns::default(),
            reasoning: None,
            attempt: 1,
        };
        let input = ExecutionInput::new(
            step("s2", StepCategory::Interface, ActionType::Modify, "src/a.rs"),
            context(),
            Vec::new(),
        )
        .after(Some(created));

        let result = stage(provider, Arc::new(MemoryRepository::new()))
            .execute(&input, &stage_ctx())
            .await
            .unwrap();
        assert_eq!(result.new_content, "pub fn a() {}\n");
        assert!(result.original_content.is_none());
        assert!(result.diff.starts_with("--- /dev/null"));
    }

    #[tokio::test]
    async fn test_write_artifacts_writes_final_content_once_per_file() {
        let repo = Arc::new(MemoryRepository::new());
        let result = |step_id: &str, path: &str, content: &str| ExecutionResult {
            step_id: step_id.into(),
            path: path.into(),
            action: ActionType::Modify,
            original_content: None,
            new_content: content.into(),
            diff: String::new(),
            edit_span: None,
            patterns: CodePatterns::default(),
            reasoning: None,
            attempt: 1,
        };
        let results = vec![
            result("s1", "src/a.rs", "one\n"),
            result("s2", "src/b.rs", "b\n"),
            result("s3", "src/a.rs", "one\ntwo\n"),
        ];

        let finals: Vec<&str> = final_contents(&results).iter().map(|r| r.step_id.as_str()).collect();
        assert_eq!(finals, vec!["s3", "s2"]);
        assert_eq!(write_artifacts(repo.as_ref(), &results).await.unwrap(), 2);
        assert_eq!(repo.get("src/a.rs").await.as_deref(), Some("one\ntwo\n"));
        assert_eq!(repo.get("src/b.rs").await.as_deref(), Some("b\n"));
    }
}
