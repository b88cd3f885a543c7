//! Plan domain model and the category precedence table.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category of a plan step. Declaration order is precedence order: a step
/// may never come before a step of a lower-ranked category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCategory {
    /// Schemas, migrations, persisted data shapes.
    DataLayer,
    Configuration,
    CoreLogic,
    /// APIs, CLIs, UI surfaces consuming the core.
    Interface,
    Tests,
    Documentation,
}

impl StepCategory {
    pub fn rank(&self) -> u8 {
        match self {
            Self::DataLayer => 0,
            Self::Configuration => 1,
            Self::CoreLogic => 2,
            Self::Interface => 3,
            Self::Tests => 4,
            Self::Documentation => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataLayer => "data_layer",
            Self::Configuration => "configuration",
            Self::CoreLogic => "core_logic",
            Self::Interface => "interface",
            Self::Tests => "tests",
            Self::Documentation => "documentation",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace(['-', ' '], "_").as_str() {
            "data_layer" | "data" | "schema" | "migration" => Some(Self::DataLayer),
            "configuration" | "config" => Some(Self::Configuration),
            "core_logic" | "core" | "logic" | "code" => Some(Self::CoreLogic),
            "interface" | "api" | "ui" => Some(Self::Interface),
            "tests" | "test" => Some(Self::Tests),
            "documentation" | "docs" => Some(Self::Documentation),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Create,
    Modify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// One intended change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub category: StepCategory,
    pub action: ActionType,
    /// Target file paths; the first is the primary target.
    pub targets: Vec<String>,
    pub description: String,
    pub risk: RiskLevel,
    /// Ids of steps that must run first.
    pub depends_on: Vec<String>,
}

impl PlanStep {
    pub fn primary_target(&self) -> Option<&str> {
        self.targets.first().map(String::as_str)
    }
}

/// Ordered intended changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
    pub rationale: String,
    /// The plan was produced without any retrieved context.
    pub context_starved: bool,
}

/// Why a plan's ordering is unacceptable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderingViolation {
    #[error("step '{step}' ({category}) is ordered after '{later}' ({later_category}) but must precede it")]
    CategoryPrecedence {
        step: String,
        category: StepCategory,
        later: String,
        later_category: StepCategory,
    },

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("step '{step}' depends on '{dependency}', which is ordered after it")]
    ForwardDependency { step: String, dependency: String },

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("step '{0}' has no target file")]
    MissingTarget(String),
}

impl Plan {
    /// Check category precedence and declared dependency order.
    pub fn check_ordering(&self) -> Result<(), OrderingViolation> {
        let mut positions: HashMap<&str, usize> = HashMap::new();
        for (index, step) in self.steps.iter().enumerate() {
            if positions.insert(step.id.as_str(), index).is_some() {
                return Err(OrderingViolation::DuplicateStep(step.id.clone()));
            }
            if step.targets.is_empty() {
                return Err(OrderingViolation::MissingTarget(step.id.clone()));
            }
        }

        for pair in self.steps.windows(2) {
            let (earlier, later) = (&pair[0], &pair[1]);
            if later.category.rank() < earlier.category.rank() {
                return Err(OrderingViolation::CategoryPrecedence {
                    step: later.id.clone(),
                    category: later.category,
                    later: earlier.id.clone(),
                    later_category: earlier.category,
                });
            }
        }

        for (index, step) in self.steps.iter().enumerate() {
            for dependency in &step.depends_on {
                match positions.get(dependency.as_str()) {
                    None => {
                        return Err(OrderingViolation::UnknownDependency {
                            step: step.id.clone(),
                            dependency: dependency.clone(),
                        })
                    }
                    Some(&pos) if pos >= index => {
                        return Err(OrderingViolation::ForwardDependency {
                            step: step.id.clone(),
                            dependency: dependency.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(())
    }

    /// Position of a step in declared order.
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    pub fn step(&self, step_id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}
