//! Squad: agent-execution substrate for local agent orchestration.
//!
//! The building blocks for running many coding-agent subprocesses safely
//! against one git repository, steered by a human operator:
//! - Event bus with typed filtering and bounded history
//! - Concurrency-limited process pool (FIFO or priority admission)
//! - Intervention detection over streamed agent output, with timeouts
//! - Git worktree allocation, tracking, and reclamation
//! - Layered configuration: defaults, user file, project file, environment
//!
//! Construct one [`EventBus`] at program start and thread it explicitly
//! into each component; there is no module-level mutable state.

pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export key types for convenience
pub use domain::models::config::Config;
pub use infrastructure::config::{ConfigLoader, LoadedConfig};
pub use infrastructure::git::GitCli;
pub use services::event_bus::{EventBus, EventFilter};
pub use services::intervention_handler::InterventionHandler;
pub use services::process_pool::ProcessPool;
pub use services::worktree_manager::WorktreeManager;
