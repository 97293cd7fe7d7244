//! Worktree allocation domain model.
//!
//! A worktree allocation couples an id, a filesystem path linked to a
//! repository as an independent working tree, and the agent or feature
//! the tree was handed to.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::ids;

/// Lifecycle state of an allocation.
///
/// `Released` is terminal; staleness is derived from `last_used_at`,
/// never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationStatus {
    Active,
    Released,
}

impl AllocationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Released => "released",
        }
    }
}

impl std::fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tracked worktree handed out to an agent or feature.
#[derive(Debug, Clone)]
pub struct WorktreeAllocation {
    /// Unique identifier (`wta_…`).
    pub id: String,
    /// Absolute path of the hosting repository.
    pub repo_path: PathBuf,
    /// Absolute path of the worktree directory; unique among live allocations.
    pub worktree_path: PathBuf,
    /// Branch checked out in the worktree.
    pub branch_name: String,
    /// Branch the worktree branch was created from.
    pub base_branch: String,
    /// Owning agent, if any.
    pub agent_id: Option<String>,
    /// Owning feature, if any.
    pub feature_id: Option<String>,
    /// Wall-clock creation time, for audit.
    pub created_at: DateTime<Utc>,
    /// Monotonic last-use instant; drives staleness.
    pub last_used_at: Instant,
    pub status: AllocationStatus,
    /// Set when the caller reports uncommitted changes.
    pub dirty: bool,
}

impl WorktreeAllocation {
    pub fn new(
        id: String,
        repo_path: PathBuf,
        worktree_path: PathBuf,
        branch_name: String,
        base_branch: String,
        agent_id: Option<String>,
        feature_id: Option<String>,
    ) -> Self {
        Self {
            id,
            repo_path,
            worktree_path,
            branch_name,
            base_branch,
            agent_id,
            feature_id,
            created_at: Utc::now(),
            last_used_at: Instant::now(),
            status: AllocationStatus::Active,
            dirty: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AllocationStatus::Active
    }

    /// Whether this allocation is stale under the given threshold.
    ///
    /// Staleness is a classification of active allocations, not a stored state.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.is_active() && self.last_used_at.elapsed() > threshold
    }

    pub fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }
}

/// Parameters for a worktree allocation.
#[derive(Debug, Clone)]
pub struct WorktreeRequest {
    pub repo_path: PathBuf,
    pub base_branch: String,
    pub agent_id: Option<String>,
    pub feature_id: Option<String>,
    /// Explicit branch name; derived from the owner when absent.
    pub branch_name: Option<String>,
}

impl WorktreeRequest {
    pub fn new(repo_path: impl Into<PathBuf>, base_branch: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
            base_branch: base_branch.into(),
            agent_id: None,
            feature_id: None,
            branch_name: None,
        }
    }

    pub fn for_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn for_feature(mut self, feature_id: impl Into<String>) -> Self {
        self.feature_id = Some(feature_id.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch_name = Some(branch.into());
        self
    }

    /// Derive a branch name when the caller did not provide one.
    pub(crate) fn derived_branch_name(&self, allocation_id: &str) -> String {
        if let Some(ref branch) = self.branch_name {
            branch.clone()
        } else if let Some(ref agent) = self.agent_id {
            format!("agent/{}", ids::short_suffix(agent))
        } else if let Some(ref feature) = self.feature_id {
            format!("feature/{}", ids::short_suffix(feature))
        } else {
            format!("tmp/{}", ids::short_suffix(allocation_id))
        }
    }
}

/// Options for releasing an allocation.
#[derive(Debug, Clone, Copy)]
pub struct ReleaseOptions {
    /// Leave the branch in place after removing the worktree.
    pub keep_branch: bool,
    /// Force removal even when the tree has uncommitted changes.
    pub force: bool,
}

impl Default for ReleaseOptions {
    fn default() -> Self {
        Self {
            keep_branch: true,
            force: false,
        }
    }
}

/// Aggregate counters over the allocation table.
#[derive(Debug, Clone, Default)]
pub struct WorktreeStats {
    pub total_allocations: usize,
    pub active_allocations: usize,
    pub dirty_allocations: usize,
    pub by_repo: HashMap<PathBuf, usize>,
    pub by_feature: HashMap<String, usize>,
}

/// Result of reconciling the allocation table with disk.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Records dropped because their directory or branch is gone.
    pub removed: usize,
    /// Directories under the base dir that no record tracks.
    pub orphaned: Vec<PathBuf>,
}
