//! Plan stage: ordered change steps from an intent and its context.
//!
//! A generated plan is checked against the category precedence table and
//! its declared dependencies before it is returned. A violating plan is
//! never passed downstream; it comes back as a recoverable
//! `PlanOrderingViolation` so the conductor can ask for one re-generation.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{info, warn};

use crate::domain::errors::{AgentError, AgentResult, ErrorKind};
use crate::domain::models::{
    ActionType, Intent, Plan, PlanStep, PlanningConfig, RetrievedContext, RiskLevel, StageId,
    StepCategory,
};
use crate::domain::ports::{GenerativeProvider, ProviderRequest};
use crate::services::stage::{PlanInput, Stage, StageContext, StageOutcome};

const SYSTEM_PROMPT: &str = "You plan code changes. Break the request into the smallest set of \
ordered steps. Each step changes one primary file. Order steps by category: data_layer, \
configuration, core_logic, interface, tests, documentation. A step may only depend on \
steps listed before it.";

/// Characters of each chunk shown to the planner.
const CHUNK_PREVIEW_CHARS: usize = 600;

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PlanResponse {
    pub steps: Vec<PlanStepResponse>,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PlanStepResponse {
    #[serde(default)]
    pub id: Option<String>,
    pub category: String,
    pub action: String,
    pub targets: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub risk: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

pub struct PlanStage {
    provider: Arc<dyn GenerativeProvider>,
    config: PlanningConfig,
}

impl PlanStage {
    pub fn new(provider: Arc<dyn GenerativeProvider>, config: PlanningConfig) -> Self {
        Self { provider, config }
    }

    pub async fn plan(
        &self,
        intent: &Intent,
        context: &RetrievedContext,
        feedback: Option<&str>,
        ctx: &StageContext,
    ) -> AgentResult<Plan> {
        let prompt = build_prompt(intent, context, feedback);
        let request =
            ProviderRequest::new(StageId::Plan, SYSTEM_PROMPT, prompt).expecting::<PlanResponse>();

        let response = self
            .provider
            .generate(request)
            .await
            .map_err(|e| e.into_agent_error(StageId::Plan))?;
        ctx.record_usage(response.usage);

        let parsed: PlanResponse = response
            .parse()
            .map_err(|e| e.into_agent_error(StageId::Plan))?;
        let plan = self.build_plan(parsed, context.starved)?;

        if let Err(violation) = plan.check_ordering() {
            warn!(violation = %violation, steps = plan.steps.len(), "plan rejected");
            return Err(AgentError::new(
                StageId::Plan,
                ErrorKind::PlanOrderingViolation,
                violation.to_string(),
            ));
        }

        info!(
            steps = plan.steps.len(),
            context_starved = plan.context_starved,
            "plan generated"
        );
        Ok(plan)
    }

    fn build_plan(&self, response: PlanResponse, context_starved: bool) -> AgentResult<Plan> {
        if response.steps.is_empty() {
            return Err(schema_error("plan has no steps".to_string()));
        }
        if response.steps.len() > self.config.max_steps {
            return Err(schema_error(format!(
                "plan has {} steps, limit is {}",
                response.steps.len(),
                self.config.max_steps
            )));
        }

        let steps = response
            .steps
            .into_iter()
            .enumerate()
            .map(|(index, step)| convert_step(index, step))
            .collect::<AgentResult<Vec<_>>>()?;

        Ok(Plan {
            steps,
            rationale: response.rationale,
            context_starved,
        })
    }
}

fn schema_error(message: String) -> AgentError {
    AgentError::new(StageId::Plan, ErrorKind::SchemaParseFailure, message)
}

fn convert_step(index: usize, step: PlanStepResponse) -> AgentResult<PlanStep> {
    let id = step
        .id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("step-{}", index + 1));

    let category = StepCategory::from_str(&step.category)
        .ok_or_else(|| schema_error(format!("step '{id}' has unknown category '{}'", step.category)))?;

    let action = match step.action.to_lowercase().as_str() {
        "create" | "add" | "new" => ActionType::Create,
        "modify" | "edit" | "update" | "change" => ActionType::Modify,
        other => return Err(schema_error(format!("step '{id}' has unknown action '{other}'"))),
    };

    let risk = match step.risk.as_deref().map(str::to_lowercase).as_deref() {
        Some("high") => RiskLevel::High,
        Some("medium") => RiskLevel::Medium,
        _ => RiskLevel::Low,
    };

    let targets: Vec<String> = step
        .targets
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    Ok(PlanStep {
        id,
        category,
        action,
        targets,
        description: step.description,
        risk,
        depends_on: step.depends_on,
    })
}

fn build_prompt(intent: &Intent, context: &RetrievedContext, feedback: Option<&str>) -> String {
    let mut prompt = format!(
        "## Intent\nTask: {}\nScope: {}\nSummary: {}\nEntities: {}\n\n## Relevant code\n",
        intent.task_type.as_str(),
        intent.scope.as_str(),
        intent.summary,
        if intent.entities.is_empty() {
            "none".to_string()
        } else {
            intent.entities.join(", ")
        }
    );

    if context.chunks.is_empty() {
        prompt.push_str("No relevant code was found. Plan from the intent alone.\n");
    }
    for chunk in &context.chunks {
        let preview: String = chunk.content.chars().take(CHUNK_PREVIEW_CHARS).collect();
        let _ = writeln!(
            prompt,
            "### {}:{}-{} (relevance {:.2})\n{}\n",
            chunk.path, chunk.start_line, chunk.end_line, chunk.relevance, preview
        );
    }

    if let Some(feedback) = feedback {
        let _ = write!(
            prompt,
            "\n## Previous plan was rejected\n{feedback}\nProduce a corrected plan.\n"
        );
    }

    prompt.push_str(
        "\nRespond with steps (id, category, action create|modify, targets, description, \
         risk low|medium|high, depends_on) and a rationale.",
    );
    prompt
}

#[async_trait]
impl Stage for PlanStage {
    type Input = PlanInput;
    type Output = Plan;

    fn id(&self) -> StageId {
        StageId::Plan
    }

    async fn run(&self, input: &PlanInput, ctx: &StageContext) -> StageOutcome<Plan> {
        self.plan(&input.intent, &input.context, input.feedback.as_deref(), ctx)
            .await
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::providers::ScriptedProvider;
    use crate::test_support::{chunk, intent, stage_ctx};
    use serde_json::json;

    fn context() -> RetrievedContext {
        RetrievedContext {
            chunks: vec![chunk("src/config.rs", 1, "pub struct Config {}", 0.8)],
            tokens_used: 5,
            token_budget: 100,
            starved: false,
        }
    }

    async fn plan_with(output: serde_json::Value, context: &RetrievedContext) -> AgentResult<Plan> {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_output(StageId::Plan, output).await;
        PlanStage::new(provider, PlanningConfig::default())
            .plan(&intent(0.9), context, None, &stage_ctx())
            .await
    }

    #[tokio::test]
    async fn test_valid_plan() {
        let plan = plan_with(
            json!({
                "steps": [
                    {"id": "schema", "category": "data_layer", "action": "modify", "targets": ["src/config.rs"], "description": "add field"},
                    {"id": "parse", "category": "core_logic", "action": "create", "targets": ["src/parse.rs"], "depends_on": ["schema"], "risk": "medium"}
                ],
                "rationale": "schema first"
            }),
            &context(),
        )
        .await
        .unwrap();

        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].action, ActionType::Create);
        assert_eq!(plan.steps[1].risk, RiskLevel::Medium);
        assert!(!plan.context_starved);
    }

    #[tokio::test]
    async fn test_precedence_violation_is_recoverable() {
        let err = plan_with(
            json!({
                "steps": [
                    {"id": "code", "category": "core_logic", "action": "modify", "targets": ["src/a.rs"]},
                    {"id": "schema", "category": "data_layer", "action": "modify", "targets": ["src/schema.rs"]}
                ]
            }),
            &context(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, ErrorKind::PlanOrderingViolation);
        assert_eq!(err.severity, crate::domain::errors::Severity::Recoverable);
    }

    #[tokio::test]
    async fn test_empty_plan_is_schema_failure() {
        let err = plan_with(json!({"steps": []}), &context()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::SchemaParseFailure);
    }

    #[tokio::test]
    async fn test_missing_ids_are_generated() {
        let plan = plan_with(
            json!({"steps": [{"category": "tests", "action": "add", "targets": ["tests/a.rs"]}]}),
            &context(),
        )
        .await
        .unwrap();
        assert_eq!(plan.steps[0].id, "step-1");
    }

    #[tokio::test]
    async fn test_starved_context_marks_plan() {
        let plan = plan_with(
            json!({"steps": [{"category": "core_logic", "action": "create", "targets": ["src/new.rs"]}]}),
            &RetrievedContext::starved(100),
        )
        .await
        .unwrap();
        assert!(plan.context_starved);
    }

    #[test]
    fn test_prompt_includes_feedback() {
        let prompt = build_prompt(&intent(0.9), &context(), Some("schema must come first"));
        assert!(prompt.contains("Previous plan was rejected"));
        assert!(prompt.contains("schema must come first"));
        assert!(prompt.contains("src/config.rs:1-1"));
    }
}
