//! Domain layer for the conductor pipeline
//!
//! Pure data models, the error taxonomy, and the port traits through which
//! the services reach external collaborators.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{AgentError, AgentResult, ErrorKind, Severity};
