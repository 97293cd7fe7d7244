//! Git worktree port.
//!
//! The worktree manager owns policy; this trait owns mechanism. The
//! production implementation shells out to the `git` CLI
//! ([`GitCli`](crate::infrastructure::git::GitCli)); tests substitute
//! an in-memory fake.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::domain::error::GitError;

/// One entry of `git worktree list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeListEntry {
    pub path: PathBuf,
    /// HEAD commit, absent for a bare entry.
    pub head: Option<String>,
    /// Checked-out branch, absent when detached.
    pub branch: Option<String>,
    pub locked: bool,
}

/// Low-level git worktree operations.
///
/// Every method maps to a single git invocation; failures preserve the
/// command's exit code and stderr.
#[async_trait]
pub trait GitWorktree: Send + Sync {
    /// Create a worktree at `worktree` on a new `branch` from `base`.
    async fn add(
        &self,
        repo: &Path,
        worktree: &Path,
        branch: &str,
        base: &str,
    ) -> Result<(), GitError>;

    /// Remove the worktree at `worktree`.
    async fn remove(&self, repo: &Path, worktree: &Path, force: bool) -> Result<(), GitError>;

    /// List worktrees attached to `repo`.
    async fn list(&self, repo: &Path) -> Result<Vec<WorktreeListEntry>, GitError>;

    /// Lock a worktree against pruning.
    async fn lock(&self, repo: &Path, worktree: &Path, reason: Option<&str>) -> Result<(), GitError>;

    /// Unlock a previously locked worktree.
    async fn unlock(&self, repo: &Path, worktree: &Path) -> Result<(), GitError>;

    /// Prune worktree records whose directories are gone.
    async fn prune(&self, repo: &Path) -> Result<(), GitError>;

    /// Whether the working tree has no uncommitted changes.
    async fn is_clean(&self, worktree: &Path) -> Result<bool, GitError>;

    /// Name of the branch checked out at `worktree`.
    async fn current_branch(&self, worktree: &Path) -> Result<String, GitError>;

    /// Delete a branch in `repo`. `force` deletes unmerged branches.
    async fn delete_branch(&self, repo: &Path, branch: &str, force: bool) -> Result<(), GitError>;
}
