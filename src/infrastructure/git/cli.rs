//! Git CLI adapter for the worktree port.
//!
//! Each operation is a single `git` invocation run through
//! `tokio::process`; non-zero exits surface as [`GitError::CommandFailed`]
//! with the exit code and stderr preserved verbatim.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::domain::error::GitError;
use crate::domain::ports::git_worktree::{GitWorktree, WorktreeListEntry};

/// Production [`GitWorktree`] implementation shelling out to `git`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<String, GitError> {
        debug!(cwd = %cwd.display(), args = ?args, "running git");
        let output = Command::new("git")
            .current_dir(cwd)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| GitError::Spawn(err.to_string()))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(GitError::CommandFailed {
                command: format!("git {}", args.join(" ")),
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}

#[async_trait]
impl GitWorktree for GitCli {
    async fn add(
        &self,
        repo: &Path,
        worktree: &Path,
        branch: &str,
        base: &str,
    ) -> Result<(), GitError> {
        let worktree = worktree.to_string_lossy();
        self.run(repo, &["worktree", "add", "-b", branch, &worktree, base])
            .await
            .map(|_| ())
    }

    async fn remove(&self, repo: &Path, worktree: &Path, force: bool) -> Result<(), GitError> {
        let worktree = worktree.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&worktree);
        self.run(repo, &args).await.map(|_| ())
    }

    async fn list(&self, repo: &Path) -> Result<Vec<WorktreeListEntry>, GitError> {
        let stdout = self.run(repo, &["worktree", "list", "--porcelain"]).await?;
        Ok(parse_worktree_list(&stdout))
    }

    async fn lock(
        &self,
        repo: &Path,
        worktree: &Path,
        reason: Option<&str>,
    ) -> Result<(), GitError> {
        let worktree = worktree.to_string_lossy();
        let mut args = vec!["worktree", "lock"];
        if let Some(reason) = reason {
            args.push("--reason");
            args.push(reason);
        }
        args.push(&worktree);
        self.run(repo, &args).await.map(|_| ())
    }

    async fn unlock(&self, repo: &Path, worktree: &Path) -> Result<(), GitError> {
        let worktree = worktree.to_string_lossy();
        self.run(repo, &["worktree", "unlock", &worktree])
            .await
            .map(|_| ())
    }

    async fn prune(&self, repo: &Path) -> Result<(), GitError> {
        self.run(repo, &["worktree", "prune"]).await.map(|_| ())
    }

    async fn is_clean(&self, worktree: &Path) -> Result<bool, GitError> {
        let stdout = self.run(worktree, &["status", "--porcelain"]).await?;
        Ok(stdout.trim().is_empty())
    }

    async fn current_branch(&self, worktree: &Path) -> Result<String, GitError> {
        let stdout = self
            .run(worktree, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        Ok(stdout.trim().to_string())
    }

    async fn delete_branch(&self, repo: &Path, branch: &str, force: bool) -> Result<(), GitError> {
        let flag = if force { "-D" } else { "-d" };
        self.run(repo, &["branch", flag, branch]).await.map(|_| ())
    }
}

/// Parse `git worktree list --porcelain` output: blank-line separated
/// blocks of `worktree <path>`, `HEAD <sha>`, `branch <ref>`, `locked`.
fn parse_worktree_list(stdout: &str) -> Vec<WorktreeListEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeListEntry> = None;

    for line in stdout.lines() {
        if line.is_empty() {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            continue;
        }
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            current = Some(WorktreeListEntry {
                path: PathBuf::from(path),
                head: None,
                branch: None,
                locked: false,
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            entry.branch = Some(
                branch
                    .strip_prefix("refs/heads/")
                    .unwrap_or(branch)
                    .to_string(),
            );
        } else if line == "locked" || line.starts_with("locked ") {
            entry.locked = true;
        }
    }
    if let Some(entry) = current.take() {
        entries.push(entry);
    }
    entries
}
