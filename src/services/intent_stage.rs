//! Intent stage: turns a raw request into a structured [`Intent`].
//!
//! Low confidence and contradictory requests do not fail the stage. They
//! return an intent flagged `needs_clarification` and the conductor takes the
//! clarification path from there.

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{debug, info};

use crate::domain::errors::{AgentError, AgentResult, ErrorKind};
use crate::domain::models::{Intent, IntentConfig, Priority, Scope, StageId, TaskType};
use crate::domain::ports::{GenerativeProvider, ProviderRequest};
use crate::services::retry::RetryPolicy;
use crate::services::stage::{IntentInput, Stage, StageContext, StageOutcome};

const SYSTEM_PROMPT: &str = "You interpret change requests against a code project. \
Classify the request, extract the identifiers, paths and concepts it names, and \
report how confident you are that the interpretation is what the author meant. \
List any statements in the request that contradict each other.";

/// Shape the provider must return.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct IntentResponse {
    pub task_type: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    pub confidence: f32,
    pub summary: String,
    #[serde(default)]
    pub contradictions: Vec<String>,
    #[serde(default)]
    pub clarifying_question: Option<String>,
}

pub struct IntentStage {
    provider: Arc<dyn GenerativeProvider>,
    config: IntentConfig,
    retry: RetryPolicy,
}

impl IntentStage {
    /// `retry` supplies the backoff schedule; the attempt bound comes from
    /// `config.provider_retries`.
    pub fn new(provider: Arc<dyn GenerativeProvider>, config: IntentConfig, retry: &RetryPolicy) -> Self {
        let retry = retry.with_max_attempts(config.provider_retries + 1);
        Self {
            provider,
            config,
            retry,
        }
    }

    pub async fn analyze(
        &self,
        request: &str,
        prior_summary: Option<&str>,
        ctx: &StageContext,
    ) -> AgentResult<Intent> {
        let request = request.trim();
        if request.is_empty() {
            return Err(AgentError::new(
                StageId::Intent,
                ErrorKind::ClarificationNeeded,
                "request is empty",
            ));
        }

        let prompt = build_prompt(request, prior_summary);
        let provider_request =
            ProviderRequest::new(StageId::Intent, SYSTEM_PROMPT, prompt).expecting::<IntentResponse>();

        let response = self
            .retry
            .execute(StageId::Intent, &ctx.cancel, |_| {
                let request = provider_request.clone();
                async move {
                    self.provider
                        .generate(request)
                        .await
                        .map_err(|e| e.into_agent_error(StageId::Intent))
                }
            })
            .await?;
        ctx.record_usage(response.usage);

        let parsed: IntentResponse = response
            .parse()
            .map_err(|e| e.into_agent_error(StageId::Intent))?;
        let intent = self.interpret(parsed)?;

        info!(
            task_type = intent.task_type.as_str(),
            scope = intent.scope.as_str(),
            confidence = intent.confidence,
            entities = intent.entities.len(),
            needs_clarification = intent.needs_clarification,
            "intent analyzed"
        );
        Ok(intent)
    }

    fn interpret(&self, response: IntentResponse) -> AgentResult<Intent> {
        let task_type = TaskType::from_str(&response.task_type).ok_or_else(|| {
            AgentError::new(
                StageId::Intent,
                ErrorKind::SchemaParseFailure,
                format!("unknown task type '{}'", response.task_type),
            )
        })?;
        let scope = response
            .scope
            .as_deref()
            .and_then(Scope::from_str)
            .unwrap_or_default();
        let priority = response
            .priority
            .as_deref()
            .and_then(Priority::from_str)
            .unwrap_or_default();

        let confidence = if response.confidence.is_finite() {
            response.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let mut entities: Vec<String> = Vec::with_capacity(response.entities.len());
        for entity in response.entities {
            let entity = entity.trim();
            if !entity.is_empty() && !entities.iter().any(|e| e == entity) {
                entities.push(entity.to_string());
            }
        }

        let low_confidence = confidence < self.config.confidence_threshold;
        let contradictory = !response.contradictions.is_empty();
        let needs_clarification = low_confidence || contradictory;

        let clarifying_question = if needs_clarification {
            debug!(low_confidence, contradictory, "intent needs clarification");
            Some(response.clarifying_question.unwrap_or_else(|| {
                default_question(&response.summary, &response.contradictions)
            }))
        } else {
            None
        };

        Ok(Intent {
            task_type,
            scope,
            priority,
            entities,
            confidence,
            summary: response.summary.trim().to_string(),
            needs_clarification,
            clarifying_question,
        })
    }
}

fn build_prompt(request: &str, prior_summary: Option<&str>) -> String {
    let history = prior_summary
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("No prior conversation");
    format!(
        "## Conversation so far\n{history}\n\n## Request\n{request}\n\n\
         Respond with task_type (feature|bug_fix|refactor|test|documentation|configuration), \
         scope (single_file|multi_file|module|project_wide), priority (low|normal|high|critical), \
         entities, confidence (0.0-1.0), a one-sentence summary, contradictions, and a \
         clarifying_question if the request is ambiguous."
    )
}

fn default_question(summary: &str, contradictions: &[String]) -> String {
    if contradictions.is_empty() {
        format!("Could you clarify what you mean by: \"{}\"?", summary.trim())
    } else {
        format!(
            "The request contains conflicting statements ({}). Which should take precedence?",
            contradictions.join("; ")
        )
    }
}

#[async_trait]
impl Stage for IntentStage {
    type Input = IntentInput;
    type Output = Intent;

    fn id(&self) -> StageId {
        StageId::Intent
    }

    async fn run(&self, input: &IntentInput, ctx: &StageContext) -> StageOutcome<Intent> {
        self.analyze(&input.request, input.prior_summary.as_deref(), ctx)
            .await
            .into()
    }
}
