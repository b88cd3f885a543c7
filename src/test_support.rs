//! Builders shared by unit tests.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapters::sinks::NullEventSink;
use crate::domain::models::{
    ActionType, CodeChunk, Intent, Plan, PlanStep, Priority, RiskLevel, Scope, StepCategory,
    TaskType,
};
use crate::services::stage::StageContext;

pub fn stage_ctx() -> StageContext {
    StageContext::new(Uuid::new_v4(), CancellationToken::new(), Arc::new(NullEventSink))
}

pub fn intent(confidence: f32) -> Intent {
    Intent {
        task_type: TaskType::Feature,
        scope: Scope::SingleFile,
        priority: Priority::Normal,
        entities: vec!["parse_config".to_string()],
        confidence,
        summary: "add config parsing".to_string(),
        needs_clarification: false,
        clarifying_question: None,
    }
}

pub fn chunk(path: &str, start_line: usize, content: &str, relevance: f32) -> CodeChunk {
    CodeChunk::new(path, start_line, content).with_relevance(relevance)
}

pub fn step(id: &str, category: StepCategory, action: ActionType, target: &str) -> PlanStep {
    PlanStep {
        id: id.to_string(),
        category,
        action,
        targets: vec![target.to_string()],
        description: format!("{id} step"),
        risk: RiskLevel::Low,
        depends_on: Vec::new(),
    }
}

pub fn plan(steps: Vec<PlanStep>) -> Plan {
    Plan {
        steps,
        rationale: "test plan".to_string(),
        context_starved: false,
    }
}
