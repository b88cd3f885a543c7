//! Pipeline services.
//!
//! The five stages, the shared helpers they use (retry, pattern
//! extraction, precision edits, the streaming event queue), the conductor
//! that sequences them, and the runner that wraps a conductor with history.

pub mod conductor;
pub mod context_stage;
pub mod event_stream;
pub mod executor;
pub mod intent_stage;
pub mod pattern_extractor;
pub mod planner;
pub mod precision_edit;
pub mod retry;
pub mod runner;
pub mod stage;
pub mod validator;

pub use conductor::Conductor;
pub use context_stage::ContextStage;
pub use event_stream::EventQueue;
pub use executor::ExecutionStage;
pub use intent_stage::IntentStage;
pub use planner::PlanStage;
pub use retry::RetryPolicy;
pub use runner::PipelineRunner;
pub use stage::{Stage, StageContext, StageOutcome, StageSet};
pub use validator::ValidationStage;
