//! Adapters implementing the domain ports.
//!
//! - `providers`: generative providers (scripted replay)
//! - `index`: keyword code index over a source tree
//! - `repository`: filesystem and in-memory repository accessors
//! - `sinks`: event sinks (tracing, recording, fan-out)
//! - `history`: conversation history stores

pub mod history;
pub mod index;
pub mod providers;
pub mod repository;
pub mod sinks;
