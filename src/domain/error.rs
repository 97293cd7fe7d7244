//! Domain error types for the agent-execution substrate.
//!
//! Each enum covers one component. Errors are returned as values from the
//! operation that produced them; timer-driven transitions publish events
//! instead of erroring.

use std::path::PathBuf;

use thiserror::Error;

use super::models::intervention::InterventionStatus;

/// Errors from process pool operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// `set_limit` called with a limit below 1.
    #[error("Pool limit must be at least 1, got {0}")]
    LimitTooLow(usize),

    /// The waiter queue was cleared while this acquisition was pending.
    #[error("Pool acquisition failed: queue cleared")]
    QueueCleared,
}

/// Errors from intervention handler operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterventionError {
    /// No request with the given id exists.
    #[error("Intervention request not found: {0}")]
    NotFound(String),

    /// The request already left `pending`; terminal states never change.
    #[error("Intervention request {id} is not pending (status: {status})")]
    NotPending {
        id: String,
        status: InterventionStatus,
    },
}

/// Failure of a git primitive, preserving exit code and stderr verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GitError {
    #[error("git {command} failed (exit code {exit_code:?}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Failed to launch git: {0}")]
    Spawn(String),
}

impl GitError {
    /// Whether this failure indicates the worktree directory is already gone.
    pub fn is_missing_worktree(&self) -> bool {
        match self {
            Self::CommandFailed { stderr, .. } => {
                let stderr = stderr.to_lowercase();
                stderr.contains("is not a working tree")
                    || stderr.contains("no such file or directory")
                    || stderr.contains("does not exist")
            }
            Self::Spawn(_) => false,
        }
    }
}

/// Errors from worktree allocation and release.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorktreeError {
    /// `max_per_repo` reached with no reclaimable allocation.
    #[error("Worktree capacity exhausted for {}: {max_per_repo} allocations in use", repo_path.display())]
    CapacityExhausted {
        repo_path: PathBuf,
        max_per_repo: usize,
    },

    /// The target branch is already attached to another worktree or ref.
    #[error("Branch already in use by another worktree: {0}")]
    BranchConflict(String),

    /// The chosen worktree path already exists on disk.
    #[error("Worktree path already exists: {}", .0.display())]
    PathConflict(PathBuf),

    /// No allocation with the given id exists.
    #[error("Worktree allocation not found: {0}")]
    NotFound(String),

    /// The underlying git primitive failed.
    #[error(transparent)]
    Git(#[from] GitError),

    /// Filesystem operation failed.
    #[error("Worktree filesystem error: {0}")]
    Io(String),
}

impl WorktreeError {
    /// Whether retrying with a fresh allocation id could succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::BranchConflict(_) | Self::PathConflict(_))
    }
}

/// One offending configuration field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Dotted path into the config tree, e.g. `pool.maxConcurrent`.
    pub path: String,
    pub reason: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

/// Errors from configuration loading. Both variants are fatal to startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A config source exists but cannot be read or parsed.
    #[error("Config source unreadable: {}: {reason}", path.display())]
    SourceUnreadable { path: PathBuf, reason: String },

    /// The merged record violates the schema; lists every offending field.
    #[error("Config validation failed: {}", format_field_errors(errors))]
    ValidationFailed { errors: Vec<FieldError> },
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
