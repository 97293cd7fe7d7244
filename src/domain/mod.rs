//! Domain layer for the agent-execution substrate.
//!
//! Core models, error types, and the ports the services depend on.

pub mod error;
pub mod models;
pub mod ports;

pub use error::{ConfigError, FieldError, GitError, InterventionError, PoolError, WorktreeError};
