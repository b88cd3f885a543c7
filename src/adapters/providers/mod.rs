//! Generative provider adapters.

pub mod scripted;

pub use scripted::{ScriptedFailure, ScriptedProvider, ScriptedReply};
