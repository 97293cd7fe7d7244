//! Worktree manager: allocation, tracking, and reclamation of per-agent
//! git worktrees.
//!
//! The manager owns policy; the [`GitWorktree`] port owns mechanism. The
//! allocation table lock is never held across a git subprocess call: the
//! table reserves the path first, performs the subprocess, then reacquires
//! to finalize or roll back. Mutating operations are serialized by a
//! separate async lock so concurrent allocates can never share a path or
//! exceed the per-repo budget; reads observe a consistent snapshot.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::domain::error::{GitError, WorktreeError};
use crate::domain::models::config::WorktreePoolConfig;
use crate::domain::models::event::EventPayload;
use crate::domain::models::ids;
use crate::domain::models::worktree::{
    ReleaseOptions, SyncReport, WorktreeAllocation, WorktreeRequest, WorktreeStats,
};
use crate::domain::ports::GitWorktree;

use super::event_bus::EventBus;

struct ManagerState {
    allocations: HashMap<String, WorktreeAllocation>,
    /// Paths handed out but not yet finalized; upholds path uniqueness
    /// while the git subprocess runs outside the table lock.
    reserved_paths: HashSet<PathBuf>,
}

/// Owns the pool of worktree directories and their lifecycle.
pub struct WorktreeManager {
    config: WorktreePoolConfig,
    git: Arc<dyn GitWorktree>,
    bus: Arc<EventBus>,
    state: Mutex<ManagerState>,
    /// Serializes mutating operations; never the table lock across awaits.
    op_lock: tokio::sync::Mutex<()>,
}

impl WorktreeManager {
    pub fn new(config: WorktreePoolConfig, git: Arc<dyn GitWorktree>, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            git,
            bus,
            state: Mutex::new(ManagerState {
                allocations: HashMap::new(),
                reserved_paths: HashSet::new(),
            }),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ensure the base directory exists and reconcile with disk.
    pub async fn initialize(&self) -> Result<SyncReport, WorktreeError> {
        tokio::fs::create_dir_all(&self.config.base_dir)
            .await
            .map_err(|err| WorktreeError::Io(err.to_string()))?;
        Ok(self.sync_with_disk().await)
    }

    /// Allocate a worktree for an agent or feature.
    ///
    /// At `max_per_repo`, the oldest stale non-dirty allocation for the repo
    /// is reclaimed first (when `auto_cleanup` is on); otherwise the call
    /// fails with [`WorktreeError::CapacityExhausted`].
    pub async fn allocate(
        &self,
        request: WorktreeRequest,
    ) -> Result<WorktreeAllocation, WorktreeError> {
        let _op = self.op_lock.lock().await;

        let reclaim_id = {
            let state = self.state();
            let live = state
                .allocations
                .values()
                .filter(|a| a.is_active() && a.repo_path == request.repo_path)
                .count();
            if live >= self.config.max_per_repo {
                let candidate = if self.config.auto_cleanup {
                    let threshold = self.config.stale_threshold();
                    state
                        .allocations
                        .values()
                        .filter(|a| {
                            a.repo_path == request.repo_path && !a.dirty && a.is_stale(threshold)
                        })
                        .min_by_key(|a| a.last_used_at)
                        .map(|a| a.id.clone())
                } else {
                    None
                };
                match candidate {
                    Some(id) => Some(id),
                    None => {
                        return Err(WorktreeError::CapacityExhausted {
                            repo_path: request.repo_path.clone(),
                            max_per_repo: self.config.max_per_repo,
                        });
                    }
                }
            } else {
                None
            }
        };

        if let Some(ref stale_id) = reclaim_id {
            debug!(allocation = %stale_id, "reclaiming stale allocation for capacity");
            self.release_inner(stale_id, ReleaseOptions::default())
                .await?;
        }

        let allocation_id = ids::allocation_id();
        let branch = request.derived_branch_name(&allocation_id);
        let worktree_path = self
            .config
            .base_dir
            .join(repo_hash(&request.repo_path))
            .join(&allocation_id);

        {
            let mut state = self.state();
            if state.allocations.values().any(|a| {
                a.is_active() && a.repo_path == request.repo_path && a.branch_name == branch
            }) {
                return Err(WorktreeError::BranchConflict(branch));
            }
            if state.reserved_paths.contains(&worktree_path)
                || state
                    .allocations
                    .values()
                    .any(|a| a.is_active() && a.worktree_path == worktree_path)
            {
                return Err(WorktreeError::PathConflict(worktree_path));
            }
            state.reserved_paths.insert(worktree_path.clone());
        }

        let mut reservation = Reservation {
            state: &self.state,
            git: Arc::clone(&self.git),
            repo: request.repo_path.clone(),
            path: worktree_path.clone(),
            cleanup_worktree: false,
            armed: true,
        };

        if tokio::fs::try_exists(&worktree_path).await.unwrap_or(false) {
            return Err(WorktreeError::PathConflict(worktree_path));
        }
        if let Some(parent) = worktree_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| WorktreeError::Io(err.to_string()))?;
        }

        // A cancellation from here on must roll the partial worktree back.
        reservation.cleanup_worktree = true;
        let created = self
            .git
            .add(
                &request.repo_path,
                &worktree_path,
                &branch,
                &request.base_branch,
            )
            .await;
        reservation.armed = false;

        if let Err(err) = created {
            {
                self.state().reserved_paths.remove(&worktree_path);
            }
            let _ = self.git.remove(&request.repo_path, &worktree_path, true).await;
            let classified = classify_git_error(err, &branch, &worktree_path);
            warn!(
                repo = %request.repo_path.display(),
                branch = %branch,
                error = %classified,
                "worktree allocation failed"
            );
            self.bus.emit(EventPayload::WorktreeAllocationFailed {
                repo_path: request.repo_path.clone(),
                reason: classified.to_string(),
            });
            return Err(classified);
        }

        let allocation = WorktreeAllocation::new(
            allocation_id,
            request.repo_path.clone(),
            worktree_path.clone(),
            branch.clone(),
            request.base_branch.clone(),
            request.agent_id.clone(),
            request.feature_id.clone(),
        );
        {
            let mut state = self.state();
            state.reserved_paths.remove(&worktree_path);
            state
                .allocations
                .insert(allocation.id.clone(), allocation.clone());
        }

        info!(
            allocation = %allocation.id,
            worktree = %worktree_path.display(),
            branch = %branch,
            "worktree allocated"
        );
        self.bus.emit(EventPayload::WorktreeAllocated {
            allocation_id: allocation.id.clone(),
            worktree_path,
            branch_name: branch,
        });
        Ok(allocation)
    }

    /// Remove the worktree and mark the allocation released.
    ///
    /// The record is retained for audit for the process lifetime; the
    /// released event is the final event for the allocation.
    pub async fn release(&self, allocation_id: &str, opts: ReleaseOptions) -> Result<(), WorktreeError> {
        let _op = self.op_lock.lock().await;
        self.release_inner(allocation_id, opts).await
    }

    async fn release_inner(
        &self,
        allocation_id: &str,
        opts: ReleaseOptions,
    ) -> Result<(), WorktreeError> {
        let allocation = self
            .state()
            .allocations
            .get(allocation_id)
            .cloned()
            .ok_or_else(|| WorktreeError::NotFound(allocation_id.to_string()))?;
        if !allocation.is_active() {
            return Ok(());
        }

        let exists = tokio::fs::try_exists(&allocation.worktree_path)
            .await
            .unwrap_or(false);
        if exists {
            if let Err(err) = self
                .git
                .remove(&allocation.repo_path, &allocation.worktree_path, opts.force)
                .await
            {
                if err.is_missing_worktree() {
                    debug!(
                        allocation = %allocation_id,
                        "worktree directory already gone; releasing record"
                    );
                } else {
                    return Err(WorktreeError::Git(err));
                }
            }
        } else {
            debug!(allocation = %allocation_id, "worktree directory missing on release");
        }

        if !opts.keep_branch {
            if let Err(err) = self
                .git
                .delete_branch(&allocation.repo_path, &allocation.branch_name, opts.force)
                .await
            {
                warn!(
                    branch = %allocation.branch_name,
                    error = %err,
                    "failed to delete branch on release"
                );
            }
        }

        {
            let mut state = self.state();
            if let Some(record) = state.allocations.get_mut(allocation_id) {
                record.status = crate::domain::models::worktree::AllocationStatus::Released;
                record.touch();
            }
        }

        info!(
            allocation = %allocation_id,
            worktree = %allocation.worktree_path.display(),
            "worktree released"
        );
        self.bus.emit(EventPayload::WorktreeReleased {
            allocation_id: allocation_id.to_string(),
            worktree_path: allocation.worktree_path,
        });
        Ok(())
    }

    /// Record whether the worktree has uncommitted changes.
    pub fn mark_dirty(&self, allocation_id: &str, dirty: bool) -> Result<(), WorktreeError> {
        let mut state = self.state();
        let record = state
            .allocations
            .get_mut(allocation_id)
            .ok_or_else(|| WorktreeError::NotFound(allocation_id.to_string()))?;
        record.dirty = dirty;
        Ok(())
    }

    /// Refresh the allocation's last-use instant.
    pub fn touch(&self, allocation_id: &str) -> Result<(), WorktreeError> {
        let mut state = self.state();
        let record = state
            .allocations
            .get_mut(allocation_id)
            .ok_or_else(|| WorktreeError::NotFound(allocation_id.to_string()))?;
        record.touch();
        Ok(())
    }

    /// Look up any allocation, released ones included.
    pub fn get(&self, allocation_id: &str) -> Option<WorktreeAllocation> {
        self.state().allocations.get(allocation_id).cloned()
    }

    /// Find the live allocation at a worktree path.
    pub fn find_by_path(&self, path: &Path) -> Option<WorktreeAllocation> {
        self.state()
            .allocations
            .values()
            .find(|a| a.is_active() && a.worktree_path == path)
            .cloned()
    }

    pub fn list_by_repo(&self, repo_path: &Path) -> Vec<WorktreeAllocation> {
        self.list_where(|a| a.repo_path == repo_path)
    }

    pub fn list_by_agent(&self, agent_id: &str) -> Vec<WorktreeAllocation> {
        self.list_where(|a| a.agent_id.as_deref() == Some(agent_id))
    }

    pub fn list_by_feature(&self, feature_id: &str) -> Vec<WorktreeAllocation> {
        self.list_where(|a| a.feature_id.as_deref() == Some(feature_id))
    }

    fn list_where(&self, pred: impl Fn(&WorktreeAllocation) -> bool) -> Vec<WorktreeAllocation> {
        let state = self.state();
        let mut matches: Vec<WorktreeAllocation> = state
            .allocations
            .values()
            .filter(|a| a.is_active() && pred(a))
            .cloned()
            .collect();
        matches.sort_by_key(|a| a.created_at);
        matches
    }

    /// Release every stale, non-dirty allocation. Returns how many.
    ///
    /// Dirty allocations block stale cleanup; per-entry failures downgrade
    /// to warnings.
    pub async fn cleanup_stale(&self) -> usize {
        let _op = self.op_lock.lock().await;
        let threshold = self.config.stale_threshold();
        let stale_ids: Vec<String> = {
            let state = self.state();
            state
                .allocations
                .values()
                .filter(|a| !a.dirty && a.is_stale(threshold))
                .map(|a| a.id.clone())
                .collect()
        };
        self.release_batch(stale_ids, "stale").await
    }

    /// Release every live allocation owned by a feature.
    pub async fn cleanup_feature(&self, feature_id: &str) -> usize {
        let _op = self.op_lock.lock().await;
        let ids: Vec<String> = {
            let state = self.state();
            state
                .allocations
                .values()
                .filter(|a| a.is_active() && a.feature_id.as_deref() == Some(feature_id))
                .map(|a| a.id.clone())
                .collect()
        };
        self.release_batch(ids, "feature cleanup").await
    }

    /// Release every live allocation owned by an agent.
    pub async fn cleanup_agent(&self, agent_id: &str) -> usize {
        let _op = self.op_lock.lock().await;
        let ids: Vec<String> = {
            let state = self.state();
            state
                .allocations
                .values()
                .filter(|a| a.is_active() && a.agent_id.as_deref() == Some(agent_id))
                .map(|a| a.id.clone())
                .collect()
        };
        self.release_batch(ids, "agent cleanup").await
    }

    async fn release_batch(&self, ids: Vec<String>, reason: &str) -> usize {
        let mut released = 0;
        for id in ids {
            match self.release_inner(&id, ReleaseOptions::default()).await {
                Ok(()) => released += 1,
                Err(err) => {
                    warn!(allocation = %id, error = %err, "release failed during {reason}");
                }
            }
        }
        released
    }

    /// Reconcile the allocation table with disk reality.
    ///
    /// Records whose directory is gone or whose branch no longer matches are
    /// dropped; directories under the base dir that no record tracks are
    /// collected for the caller to prune. Never aborts wholesale.
    pub async fn sync_with_disk(&self) -> SyncReport {
        let _op = self.op_lock.lock().await;
        let tracked: Vec<WorktreeAllocation> = {
            let state = self.state();
            state
                .allocations
                .values()
                .filter(|a| a.is_active())
                .cloned()
                .collect()
        };

        let mut removed = 0;
        for allocation in &tracked {
            let exists = tokio::fs::try_exists(&allocation.worktree_path)
                .await
                .unwrap_or(false);
            let mut drop_record = false;
            if exists {
                match self.git.current_branch(&allocation.worktree_path).await {
                    Ok(branch) if branch != allocation.branch_name => {
                        warn!(
                            allocation = %allocation.id,
                            expected = %allocation.branch_name,
                            found = %branch,
                            "worktree branch changed underneath; dropping record"
                        );
                        drop_record = true;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(
                            allocation = %allocation.id,
                            error = %err,
                            "could not inspect worktree; keeping record"
                        );
                    }
                }
            } else {
                warn!(
                    allocation = %allocation.id,
                    worktree = %allocation.worktree_path.display(),
                    "worktree directory gone; dropping record"
                );
                drop_record = true;
            }
            if drop_record {
                self.state().allocations.remove(&allocation.id);
                removed += 1;
            }
        }

        let orphaned = self.scan_orphans().await;
        debug!(removed, orphans = orphaned.len(), "worktree table synced with disk");
        SyncReport { removed, orphaned }
    }

    async fn scan_orphans(&self) -> Vec<PathBuf> {
        let tracked_paths: HashSet<PathBuf> = {
            let state = self.state();
            state
                .allocations
                .values()
                .filter(|a| a.is_active())
                .map(|a| a.worktree_path.clone())
                .chain(state.reserved_paths.iter().cloned())
                .collect()
        };

        let mut orphaned = Vec::new();
        let Ok(mut repo_dirs) = tokio::fs::read_dir(&self.config.base_dir).await else {
            return orphaned;
        };
        while let Ok(Some(repo_dir)) = repo_dirs.next_entry().await {
            let repo_path = repo_dir.path();
            if !repo_path.is_dir() {
                continue;
            }
            let Ok(mut worktree_dirs) = tokio::fs::read_dir(&repo_path).await else {
                warn!(dir = %repo_path.display(), "unreadable worktree group; skipping");
                continue;
            };
            while let Ok(Some(worktree_dir)) = worktree_dirs.next_entry().await {
                let path = worktree_dir.path();
                if path.is_dir() && !tracked_paths.contains(&path) {
                    orphaned.push(path);
                }
            }
        }
        orphaned
    }

    pub fn stats(&self) -> WorktreeStats {
        let state = self.state();
        let mut stats = WorktreeStats {
            total_allocations: state.allocations.len(),
            ..WorktreeStats::default()
        };
        for allocation in state.allocations.values() {
            if !allocation.is_active() {
                continue;
            }
            stats.active_allocations += 1;
            if allocation.dirty {
                stats.dirty_allocations += 1;
            }
            *stats
                .by_repo
                .entry(allocation.repo_path.clone())
                .or_insert(0) += 1;
            if let Some(ref feature) = allocation.feature_id {
                *stats.by_feature.entry(feature.clone()).or_insert(0) += 1;
            }
        }
        stats
    }
}

/// Unreserves a path (and rolls back a partial worktree) when an allocate
/// future is cancelled mid-flight.
struct Reservation<'a> {
    state: &'a Mutex<ManagerState>,
    git: Arc<dyn GitWorktree>,
    repo: PathBuf,
    path: PathBuf,
    cleanup_worktree: bool,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.reserved_paths.remove(&self.path);
        }
        if self.cleanup_worktree {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let git = Arc::clone(&self.git);
                let repo = self.repo.clone();
                let path = self.path.clone();
                debug!(worktree = %path.display(), "allocation cancelled; rolling back");
                handle.spawn(async move {
                    let _ = git.remove(&repo, &path, true).await;
                });
            }
        }
    }
}

/// Short hash of the repo path, one directory level under the base dir.
fn repo_hash(repo_path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo_path.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    digest
        .iter()
        .take(4)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Conflicts recoverable by choosing a new id are split out of the opaque
/// git failure; everything else keeps exit code and stderr verbatim.
fn classify_git_error(err: GitError, branch: &str, path: &Path) -> WorktreeError {
    if let GitError::CommandFailed { ref stderr, .. } = err {
        let stderr = stderr.to_lowercase();
        if stderr.contains("already checked out")
            || stderr.contains("already used by worktree")
            || (stderr.contains("branch") && stderr.contains("already exists"))
        {
            return WorktreeError::BranchConflict(branch.to_string());
        }
        if stderr.contains("already exists") {
            return WorktreeError::PathConflict(path.to_path_buf());
        }
    }
    WorktreeError::Git(err)
}
