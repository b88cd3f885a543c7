//! Common test utilities for integration tests
//!
//! Provides the stage wiring, fake indexes and scripted replies shared by
//! the scenario tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use conductor::adapters::index::KeywordIndex;
use conductor::adapters::providers::ScriptedProvider;
use conductor::adapters::repository::MemoryRepository;
use conductor::domain::models::{Config, RetryConfig, StageId};
use conductor::domain::ports::{CodeIndex, EventSink, IndexError, IndexQuery, ScoredChunk};
use conductor::services::{
    Conductor, ContextStage, ExecutionStage, IntentStage, PlanStage, RetryPolicy, StageSet,
    ValidationStage,
};
use serde_json::json;

pub const MAIN_RS: &str = "fn main() {\n    let config = load_config();\n    run(config);\n}\n";

/// Setup test logging
///
/// Initializes tracing subscriber for test output.
/// Call this at the beginning of tests that need logging.
#[allow(dead_code)]
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Config with fast, deterministic retries and deep review enabled.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retry = RetryConfig {
        max_attempts: 3,
        initial_backoff_ms: 10,
        max_backoff_ms: 100,
        multiplier: 2.0,
        jitter_ratio: 0.0,
    };
    config.validation.deep_review = true;
    config
}

/// Index wrapper counting how often it was searched.
pub struct CountingIndex {
    inner: Arc<dyn CodeIndex>,
    searches: AtomicUsize,
}

impl CountingIndex {
    pub fn new(inner: Arc<dyn CodeIndex>) -> Self {
        Self {
            inner,
            searches: AtomicUsize::new(0),
        }
    }

    #[allow(dead_code)]
    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodeIndex for CountingIndex {
    async fn search(&self, query: &IndexQuery) -> Result<Vec<ScoredChunk>, IndexError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.inner.search(query).await
    }
}

/// Index with nothing in it.
pub struct EmptyIndex;

#[async_trait]
impl CodeIndex for EmptyIndex {
    async fn search(&self, _query: &IndexQuery) -> Result<Vec<ScoredChunk>, IndexError> {
        Ok(Vec::new())
    }
}

/// A project with a single `src/main.rs`.
pub struct Fixture {
    pub provider: Arc<ScriptedProvider>,
    pub repository: Arc<MemoryRepository>,
    pub index: Arc<CountingIndex>,
    pub config: Config,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_provider(ScriptedProvider::new())
    }

    pub fn with_provider(provider: ScriptedProvider) -> Self {
        let index: Arc<dyn CodeIndex> = Arc::new(KeywordIndex::from_files(
            [("src/main.rs", MAIN_RS)],
            &Default::default(),
        ));
        Self {
            provider: Arc::new(provider),
            repository: Arc::new(MemoryRepository::with_files([("src/main.rs", MAIN_RS)])),
            index: Arc::new(CountingIndex::new(index)),
            config: test_config(),
        }
    }

    #[allow(dead_code)]
    pub fn with_index(mut self, index: impl CodeIndex + 'static) -> Self {
        self.index = Arc::new(CountingIndex::new(Arc::new(index)));
        self
    }

    pub fn stages(&self) -> StageSet {
        let retry = RetryPolicy::new(self.config.retry.clone());
        StageSet::new(
            Arc::new(IntentStage::new(self.provider.clone(), self.config.intent.clone(), &retry)),
            Arc::new(ContextStage::new(self.index.clone(), self.config.context.clone())),
            Arc::new(PlanStage::new(self.provider.clone(), self.config.planning.clone())),
            Arc::new(ExecutionStage::new(
                self.provider.clone(),
                self.repository.clone(),
                self.config.execution.clone(),
            )),
            Arc::new(ValidationStage::new(self.provider.clone(), self.config.validation.clone())),
        )
        .expect("stages registered in order")
    }

    pub fn conductor(&self, events: Arc<dyn EventSink>) -> Conductor {
        Conductor::new(self.stages(), Arc::new(self.config.clone()), events)
            .with_repository(self.repository.clone())
    }
}

/// Confident intent naming the config loader.
pub async fn script_intent(provider: &ScriptedProvider, confidence: f64) {
    provider
        .push_output(
            StageId::Intent,
            json!({
                "task_type": "bug_fix",
                "confidence": confidence,
                "summary": "handle config load failures",
                "entities": ["load_config", "run"]
            }),
        )
        .await;
}

/// One modify step on `src/main.rs`.
pub async fn script_single_step_plan(provider: &ScriptedProvider) {
    provider
        .push_output(
            StageId::Plan,
            json!({"steps": [{
                "id": "fix-main",
                "category": "core_logic",
                "action": "modify",
                "targets": ["src/main.rs"],
                "description": "handle the error from load_config"
            }]}),
        )
        .await;
}

pub async fn script_edit(provider: &ScriptedProvider, original: &str, replacement: &str) {
    provider
        .push_output(
            StageId::Execution,
            json!({
                "reasoning": {"goal": "handle the error", "constraints": ["keep the call shape"], "approach": "replace one line"},
                "edit": {"kind": "replace", "original": original, "replacement": replacement}
            }),
        )
        .await;
}

pub async fn script_review(provider: &ScriptedProvider, issues: serde_json::Value) {
    provider
        .push_output(StageId::Validation, json!({ "issues": issues }))
        .await;
}

/// A deep-review issue against `src/main.rs`.
pub fn review_issue(severity: &str, message: &str) -> serde_json::Value {
    json!({
        "category": "correctness",
        "severity": severity,
        "location": "src/main.rs",
        "message": message
    })
}
