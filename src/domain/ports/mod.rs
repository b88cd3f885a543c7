//! Port trait definitions (Hexagonal Architecture)
//!
//! Async interfaces the pipeline uses to reach its collaborators:
//! - GenerativeProvider: structured text generation
//! - CodeIndex: ranked code retrieval
//! - RepositoryAccessor: source file reads and writes
//! - EventSink: lifecycle and streaming events
//! - HistoryStore: conversation summaries and stored results
//!
//! Reference implementations live in `crate::adapters`.

pub mod code_index;
pub mod errors;
pub mod event_sink;
pub mod history;
pub mod provider;
pub mod repository;

pub use code_index::{CodeIndex, IndexQuery, ScoredChunk};
pub use errors::{HistoryError, IndexError, ProviderError, RepositoryError};
pub use event_sink::EventSink;
pub use history::HistoryStore;
pub use provider::{GenerativeProvider, ProviderRequest, ProviderResponse};
pub use repository::RepositoryAccessor;
