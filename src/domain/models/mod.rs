//! Domain models.
//!
//! Pure entities: identifiers, events, intervention requests, worktree
//! allocations, and the merged configuration record.

pub mod config;
pub mod event;
pub mod ids;
pub mod intervention;
pub mod worktree;

pub use config::{
    Config, DefaultsConfig, InterventionConfig, LoggingConfig, PoolConfig, QueueStrategy,
    WorktreePoolConfig,
};
pub use event::{Event, EventKind, EventPayload, StreamKind};
pub use intervention::{InterventionKind, InterventionRequest, InterventionStatus};
pub use worktree::{
    AllocationStatus, ReleaseOptions, SyncReport, WorktreeAllocation, WorktreeRequest,
    WorktreeStats,
};
