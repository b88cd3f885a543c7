//! Conductor - staged change-request pipeline
//!
//! A natural-language change request is processed through five stages
//! (intent, context, plan, execution, validation) with per-stage retry,
//! severity-driven recovery and a bounded validate-and-fix loop.
//!
//! # Architecture
//!
//! This crate follows Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): models, the error taxonomy and port traits
//! - **Service Layer** (`services`): the stages, the conductor and the runner
//! - **Adapters** (`adapters`): port implementations (providers, index,
//!   repository, event sinks, history)
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use conductor::services::PipelineRunner;
//!
//! let result = runner.process("conversation", "add retries to the client", cancel).await;
//! println!("{}", result.summary());
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

#[cfg(test)]
pub(crate) mod test_support;

pub use domain::errors::{AgentError, AgentResult, ErrorKind, Severity};
pub use domain::models::{Config, Phase, ProcessOutcome, ProcessResult, StageId};
pub use domain::ports::{CodeIndex, EventSink, GenerativeProvider, HistoryStore, RepositoryAccessor};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{Conductor, PipelineRunner, StageSet};
