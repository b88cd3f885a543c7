use std::sync::Arc;

use conductor::adapters::providers::ScriptedProvider;
use conductor::adapters::sinks::NullEventSink;
use conductor::domain::models::{
    ActionType, Intent, OrderingViolation, Plan, PlanStep, PlanningConfig, Priority,
    RetrievedContext, RiskLevel, Scope, StageId, StepCategory, TaskType,
};
use conductor::services::{PlanStage, StageContext};
use conductor::ErrorKind;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const CATEGORIES: [StepCategory; 6] = [
    StepCategory::DataLayer,
    StepCategory::Configuration,
    StepCategory::CoreLogic,
    StepCategory::Interface,
    StepCategory::Tests,
    StepCategory::Documentation,
];

fn category() -> impl Strategy<Value = StepCategory> {
    (0usize..CATEGORIES.len()).prop_map(|i| CATEGORIES[i])
}

fn plan_of(categories: &[StepCategory]) -> Plan {
    Plan {
        steps: categories
            .iter()
            .enumerate()
            .map(|(i, category)| PlanStep {
                id: format!("step-{i}"),
                category: *category,
                action: ActionType::Modify,
                targets: vec![format!("src/file_{i}.rs")],
                description: String::new(),
                risk: RiskLevel::Low,
                depends_on: Vec::new(),
            })
            .collect(),
        rationale: String::new(),
        context_starved: false,
    }
}

fn is_sorted(categories: &[StepCategory]) -> bool {
    categories.windows(2).all(|w| w[0].rank() <= w[1].rank())
}

fn intent() -> Intent {
    Intent {
        task_type: TaskType::Feature,
        scope: Scope::MultiFile,
        priority: Priority::Normal,
        entities: Vec::new(),
        confidence: 0.9,
        summary: "add a feature".to_string(),
        needs_clarification: false,
        clarifying_question: None,
    }
}

proptest! {
    /// Property: a plan is accepted exactly when its categories are in
    /// precedence order
    #[test]
    fn prop_ordering_accepted_iff_categories_sorted(
        categories in prop::collection::vec(category(), 1..12)
    ) {
        let result = plan_of(&categories).check_ordering();
        prop_assert_eq!(result.is_ok(), is_sorted(&categories));
        if let Err(violation) = result {
            let is_precedence = matches!(violation, OrderingViolation::CategoryPrecedence { .. });
            prop_assert!(is_precedence);
        }
    }

    /// Property: a stable sort by category always yields an acceptable plan
    #[test]
    fn prop_sorted_plan_is_always_accepted(
        mut categories in prop::collection::vec(category(), 1..12)
    ) {
        categories.sort_by_key(StepCategory::rank);
        prop_assert!(plan_of(&categories).check_ordering().is_ok());
    }

    /// Property: dependencies on earlier steps are accepted, dependencies on
    /// the step itself or later steps are not
    #[test]
    fn prop_dependencies_must_point_backwards(
        len in 2usize..10,
        from in 0usize..10,
        to in 0usize..10,
    ) {
        let from = from % len;
        let to = to % len;
        let mut plan = plan_of(&vec![StepCategory::CoreLogic; len]);
        plan.steps[from].depends_on.push(format!("step-{to}"));

        let result = plan.check_ordering();
        if to < from {
            prop_assert!(result.is_ok());
        } else {
            let is_forward = matches!(result, Err(OrderingViolation::ForwardDependency { .. }));
            prop_assert!(is_forward);
        }
    }

    /// Property: the plan stage never returns a plan that violates ordering
    #[test]
    fn prop_plan_stage_only_returns_ordered_plans(
        categories in prop::collection::vec(category(), 1..8)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TestCaseError::fail(e.to_string()))?;

        let steps: Vec<serde_json::Value> = categories
            .iter()
            .enumerate()
            .map(|(i, category)| json!({
                "id": format!("step-{i}"),
                "category": category.as_str(),
                "action": "modify",
                "targets": [format!("src/file_{i}.rs")]
            }))
            .collect();

        let outcome = runtime.block_on(async {
            let provider = Arc::new(ScriptedProvider::new());
            provider.push_output(StageId::Plan, json!({ "steps": steps })).await;
            let stage = PlanStage::new(provider, PlanningConfig::default());
            let ctx = StageContext::new(Uuid::new_v4(), CancellationToken::new(), Arc::new(NullEventSink));
            stage.plan(&intent(), &RetrievedContext::starved(8_000), None, &ctx).await
        });

        match outcome {
            Ok(plan) => {
                prop_assert!(is_sorted(&categories));
                prop_assert!(plan.check_ordering().is_ok());
                prop_assert_eq!(plan.steps.len(), categories.len());
            }
            Err(error) => {
                prop_assert!(!is_sorted(&categories));
                prop_assert_eq!(error.kind, ErrorKind::PlanOrderingViolation);
                prop_assert!(!error.is_fatal());
            }
        }
    }
}
