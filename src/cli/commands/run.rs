//! Implementation of the `conductor run` command.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapters::history::JsonFileHistory;
use crate::adapters::index::{ChunkingOptions, KeywordIndex};
use crate::adapters::providers::ScriptedProvider;
use crate::adapters::repository::FsRepository;
use crate::adapters::sinks::{FanoutEventSink, TracingEventSink};
use crate::cli::output::progress::{create_spinner, ProgressBarExt, SpinnerEventSink};
use crate::cli::output::table::TableFormatter;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::{
    ActionType, Config, Phase, PipelineMetrics, ProcessOutcome, ProcessResult, ValidationIssue,
};
use crate::domain::ports::{EventSink, RepositoryAccessor};
use crate::services::context_stage::ContextStage;
use crate::services::executor::ExecutionStage;
use crate::services::intent_stage::IntentStage;
use crate::services::planner::PlanStage;
use crate::services::retry::RetryPolicy;
use crate::services::runner::PipelineRunner;
use crate::services::stage::StageSet;
use crate::services::validator::ValidationStage;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// The change request, in natural language
    pub request: String,

    /// JSON file with scripted provider replies, keyed by stage
    #[arg(long)]
    pub fixture: PathBuf,

    /// Source tree to index and edit (defaults to current directory)
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// Summary of earlier conversation; overrides stored history
    #[arg(long)]
    pub summary: Option<String>,

    /// Conversation id used for history
    #[arg(long, default_value = "default")]
    pub conversation: String,

    /// Write accepted artifacts to the source tree
    #[arg(long)]
    pub write: bool,
}

#[derive(Debug, Serialize)]
pub struct ArtifactSummary {
    pub step_id: String,
    pub path: String,
    pub action: ActionType,
    pub attempt: u32,
    pub diff: String,
}

#[derive(Debug, Serialize)]
pub struct RunOutput {
    pub request_id: Uuid,
    pub outcome: String,
    pub final_phase: Phase,
    pub summary: String,
    pub artifacts: Vec<ArtifactSummary>,
    pub issues: Vec<ValidationIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub written: bool,
    pub metrics: PipelineMetrics,
}

impl From<&ProcessResult> for RunOutput {
    fn from(result: &ProcessResult) -> Self {
        let (issues, question, error, written) = match &result.outcome {
            ProcessOutcome::Completed {
                warnings, written, ..
            } => (warnings.clone(), None, None, *written),
            ProcessOutcome::FixLoopExhausted {
                unresolved, diagnosis, ..
            } => (unresolved.clone(), None, Some(diagnosis.to_string()), false),
            ProcessOutcome::NeedsClarification { request } => {
                (Vec::new(), Some(request.question.clone()), None, false)
            }
            ProcessOutcome::Failed { error } => (Vec::new(), None, Some(error.to_string()), false),
        };
        Self {
            request_id: result.request_id,
            outcome: result.outcome.label().to_string(),
            final_phase: result.final_phase,
            summary: result.summary(),
            artifacts: result
                .outcome
                .artifacts()
                .iter()
                .map(|a| ArtifactSummary {
                    step_id: a.step_id.clone(),
                    path: a.path.clone(),
                    action: a.action,
                    attempt: a.attempt,
                    diff: a.diff.clone(),
                })
                .collect(),
            issues,
            question,
            error,
            written,
            metrics: result.metrics.clone(),
        }
    }
}

impl CommandOutput for RunOutput {
    fn to_human(&self) -> String {
        let headline = match self.outcome.as_str() {
            "completed" => console::style(format!("✓ {}", self.summary)).green(),
            "fix_loop_exhausted" | "needs_clarification" => {
                console::style(format!("! {}", self.summary)).yellow()
            }
            _ => console::style(format!("✗ {}", self.summary)).red(),
        };
        let mut lines = vec![headline.bold().to_string()];

        if let Some(question) = &self.question {
            lines.push(format!("\n{} {question}", console::style("?").cyan().bold()));
        }
        if let Some(error) = &self.error {
            lines.push(format!("\n{error}"));
        }
        for artifact in &self.artifacts {
            lines.push(format!(
                "\n{} (step {}, attempt {})",
                console::style(&artifact.path).bold(),
                artifact.step_id,
                artifact.attempt
            ));
            lines.push(artifact.diff.trim_end().to_string());
        }

        let tables = TableFormatter::new();
        if !self.issues.is_empty() {
            lines.push("\nIssues:".to_string());
            lines.push(tables.format_issues(&self.issues));
        }
        if self.written {
            lines.push(format!("\nWrote {} file(s).", self.artifacts.len()));
        }
        lines.push("\nStages:".to_string());
        lines.push(tables.format_stage_metrics(&self.metrics));
        if self.metrics.dropped_stream_events > 0 {
            lines.push(format!(
                "{} streaming event(s) dropped",
                self.metrics.dropped_stream_events
            ));
        }
        lines.join("\n")
    }
}

/// Build the five stages over the given collaborators.
pub fn build_stages(
    provider: Arc<ScriptedProvider>,
    index: Arc<KeywordIndex>,
    repository: Arc<dyn RepositoryAccessor>,
    config: &Config,
) -> Result<StageSet> {
    let retry = RetryPolicy::new(config.retry.clone());
    StageSet::new(
        Arc::new(IntentStage::new(provider.clone(), config.intent.clone(), &retry)),
        Arc::new(ContextStage::new(index, config.context.clone())),
        Arc::new(PlanStage::new(provider.clone(), config.planning.clone())),
        Arc::new(ExecutionStage::new(provider.clone(), repository, config.execution.clone())),
        Arc::new(ValidationStage::new(provider, config.validation.clone())),
    )
    .map_err(|m| anyhow::anyhow!("stage registered as {} where {} was expected", m.actual, m.expected))
}

pub async fn execute(args: RunArgs, loaded: Result<Config>, json_mode: bool) -> Result<()> {
    let mut config = loaded.context("Failed to load configuration")?;
    if args.write {
        config.pipeline.write_artifacts = true;
    }
    let config = Arc::new(config);

    let root = match &args.source {
        Some(path) => path.clone(),
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let mut provider = ScriptedProvider::from_file(&args.fixture)?;
    if config.execution.streaming {
        provider = provider.with_streaming(24, Duration::from_millis(5));
    }
    let provider = Arc::new(provider);

    let index = Arc::new(
        KeywordIndex::from_dir(&root, &ChunkingOptions::default())
            .await
            .with_context(|| format!("Failed to index {}", root.display()))?,
    );
    let repository: Arc<dyn RepositoryAccessor> = Arc::new(FsRepository::new(&root));
    let stages = build_stages(provider, index, repository.clone(), &config)?;

    let spinner = (!json_mode).then(create_spinner);
    let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TracingEventSink)];
    if let Some(spinner) = &spinner {
        sinks.push(Arc::new(SpinnerEventSink::new(spinner.clone())));
    }
    let events = Arc::new(FanoutEventSink::new(sinks));

    let history = Arc::new(JsonFileHistory::new(root.join(".conductor").join("history")));
    let runner = PipelineRunner::new(stages, config, events, history).with_repository(repository);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling request");
            interrupt.cancel();
        }
    });

    let result = match &args.summary {
        Some(summary) => {
            runner
                .process_with_summary(&args.conversation, &args.request, Some(summary.clone()), cancel)
                .await
        }
        None => runner.process(&args.conversation, &args.request, cancel).await,
    };

    if let Some(spinner) = &spinner {
        match &result.outcome {
            ProcessOutcome::Completed { .. } => spinner.finish_success(result.outcome.label()),
            ProcessOutcome::Failed { .. } => spinner.finish_error(result.outcome.label()),
            _ => spinner.finish_warning(result.outcome.label()),
        }
    }

    output(&RunOutput::from(&result), json_mode);
    match result.outcome {
        ProcessOutcome::Failed { error } => Err(anyhow::Error::new(error).context("Request failed")),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_run_writes_artifact_with_fixture() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(
            dir.path().join("src/lib.rs"),
            "pub fn greet(name: &str) -> String {\n    format!(\"hi {name}\")\n}\n",
        )
        .unwrap();

        let fixture = dir.path().join("replies.json");
        std::fs::write(
            &fixture,
            serde_json::to_string(&json!({
                "intent": [{"task_type": "feature", "confidence": 0.9, "summary": "greet politely", "entities": ["greet"]}],
                "plan": [{"steps": [{"id": "greet", "category": "core_logic", "action": "modify", "targets": ["src/lib.rs"]}]}],
                "execution": [{"edit": {"kind": "replace", "original": "format!(\"hi {name}\")", "replacement": "format!(\"hello {name}\")"}}],
                "validation": [{"issues": []}]
            }))
            .unwrap(),
        )
        .unwrap();

        let args = RunArgs {
            request: "make greet say hello".into(),
            fixture,
            source: Some(dir.path().to_path_buf()),
            summary: None,
            conversation: "test".into(),
            write: true,
        };
        execute(args, Ok(Config::default()), true).await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("src/lib.rs")).unwrap();
        assert!(written.contains("hello {name}"));
        assert!(dir.path().join(".conductor/history/test.json").exists());
    }

    #[test]
    fn test_run_output_for_clarification() {
        let context = crate::domain::models::AccumulatedContext::new("do it", None);
        let result = ProcessResult {
            request_id: context.request_id,
            outcome: ProcessOutcome::NeedsClarification {
                request: crate::domain::models::ClarificationRequest {
                    question: "Which file?".into(),
                    reason: "ambiguous".into(),
                    partial_intent: None,
                },
            },
            context,
            metrics: PipelineMetrics::default(),
            trace: Default::default(),
            final_phase: Phase::NeedsClarification,
        };

        let out = RunOutput::from(&result);
        assert_eq!(out.outcome, "needs_clarification");
        assert_eq!(out.question.as_deref(), Some("Which file?"));
        assert!(out.to_json()["question"].is_string());
        assert!(out.to_json().get("error").is_none());
    }
}
