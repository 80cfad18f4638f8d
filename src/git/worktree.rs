//! Git worktree manager for isolated agent checkouts.
//!
//! One worktree per live worker under `.overstory/worktrees/{agent}`, each
//! on its own `overstory/{agent}/{bead}` branch cut from the canonical
//! branch. Creation is serialized per path to prevent races when two
//! schedulers admit simultaneously.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::git::cli::GitCli;

// Global locks for worktree creation (prevent race conditions)
lazy_static::lazy_static! {
    static ref WORKTREE_CREATION_LOCKS: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> =
        Mutex::new(HashMap::new());
}

/// Get or create a lock for a specific path
async fn get_path_lock(path: &Path) -> Arc<Mutex<()>> {
    let mut locks = WORKTREE_CREATION_LOCKS.lock().await;
    locks
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Information about a created worktree
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    /// Path to the worktree directory
    pub path: PathBuf,
    /// Branch checked out in the worktree
    pub branch: String,
    /// Commit the branch was cut from
    pub base_commit: String,
    /// Path to the primary repository
    pub repo_path: PathBuf,
}

/// Manages git worktrees for agent checkouts
pub struct WorktreeManager {
    /// Base directory for all worktrees (`.overstory/worktrees/`)
    base_worktree_dir: PathBuf,
}

impl WorktreeManager {
    pub fn new(base_worktree_dir: PathBuf) -> Self {
        Self { base_worktree_dir }
    }

    /// Get the worktree path for an agent
    pub fn worktree_path(&self, agent_name: &str) -> PathBuf {
        self.base_worktree_dir.join(agent_name)
    }

    /// Create a worktree for an agent on a fresh branch cut from the
    /// canonical branch. Re-entrant: an existing valid worktree on the
    /// expected branch is returned as-is.
    #[instrument(skip(self), fields(agent = %agent_name, branch = %branch_name))]
    pub async fn create_for_agent(
        &self,
        repo_path: &Path,
        agent_name: &str,
        branch_name: &str,
        canonical_branch: &str,
    ) -> Result<WorktreeInfo> {
        let worktree_path = self.worktree_path(agent_name);

        let lock = get_path_lock(&worktree_path).await;
        let _guard = lock.lock().await;

        if worktree_path.exists() {
            debug!("Worktree already exists, validating");
            return self
                .validate_existing_worktree(&worktree_path, branch_name, repo_path)
                .await;
        }

        if let Some(parent) = worktree_path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create worktree parent directory")?;
        }

        if GitCli::branch_exists(repo_path, branch_name).await? {
            return Err(anyhow!(
                "branch '{}' already exists; clean it up before re-slinging",
                branch_name
            ));
        }

        info!(?worktree_path, %canonical_branch, "Creating worktree for agent");
        GitCli::add_worktree(
            repo_path,
            &worktree_path,
            branch_name,
            true,
            Some(canonical_branch),
        )
        .await
        .context("Failed to create worktree")?;

        let base_commit = GitCli::head_commit(&worktree_path).await?;

        Ok(WorktreeInfo {
            path: worktree_path,
            branch: branch_name.to_string(),
            base_commit,
            repo_path: repo_path.to_path_buf(),
        })
    }

    /// Validate an existing worktree and return its info
    async fn validate_existing_worktree(
        &self,
        worktree_path: &Path,
        expected_branch: &str,
        repo_path: &Path,
    ) -> Result<WorktreeInfo> {
        let current_branch = GitCli::current_branch(worktree_path)
            .await
            .map_err(|_| {
                anyhow!(
                    "Path exists but is not a valid git worktree: {}",
                    worktree_path.display()
                )
            })?;

        if current_branch != expected_branch {
            warn!(
                "Existing worktree is on branch '{}', expected '{}'",
                current_branch, expected_branch
            );
        }

        let base_commit = GitCli::head_commit(worktree_path).await?;

        Ok(WorktreeInfo {
            path: worktree_path.to_path_buf(),
            branch: current_branch,
            base_commit,
            repo_path: repo_path.to_path_buf(),
        })
    }

    /// Cleanup and remove an agent's worktree
    #[instrument(skip(self), fields(agent = %agent_name))]
    pub async fn cleanup_worktree(
        &self,
        repo_path: &Path,
        agent_name: &str,
        branch_name: Option<&str>,
        prune_branch: bool,
    ) -> Result<()> {
        let worktree_path = self.worktree_path(agent_name);
        let lock = get_path_lock(&worktree_path).await;
        let _guard = lock.lock().await;

        info!(path = %worktree_path.display(), "Cleaning up worktree");

        if worktree_path.exists() {
            // First try git worktree remove
            if let Err(e) = GitCli::remove_worktree(repo_path, &worktree_path, false).await {
                warn!("git worktree remove failed, trying force: {}", e);

                if let Err(e) = GitCli::remove_worktree(repo_path, &worktree_path, true).await {
                    warn!("git worktree remove --force failed: {}", e);

                    // Last resort: remove directory manually
                    if let Err(e) = fs::remove_dir_all(&worktree_path).await {
                        warn!("Failed to remove worktree directory: {}", e);
                    }
                }
            }
        }

        if let Err(e) = GitCli::prune_worktrees(repo_path).await {
            warn!("Failed to prune worktrees: {}", e);
        }

        if prune_branch {
            if let Some(branch) = branch_name {
                if let Err(e) = GitCli::delete_branch(repo_path, branch, true).await {
                    warn!("Failed to delete branch '{}': {}", branch, e);
                }
            }
        }

        Ok(())
    }

    /// Worktree directories currently present on disk, by agent name.
    pub async fn list_on_disk(&self) -> Result<Vec<String>> {
        let mut agents = Vec::new();
        let mut entries = match fs::read_dir(&self.base_worktree_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(agents),
            Err(e) => return Err(e).context("Failed to read worktrees directory"),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                agents.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        agents.sort();
        Ok(agents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command as StdCommand, Stdio};
    use tempfile::TempDir;

    fn init_repo() -> TempDir {
        let temp = TempDir::new().unwrap();
        let run = |args: &[&str]| {
            let status = StdCommand::new("git")
                .args(args)
                .current_dir(temp.path())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .unwrap();
            assert!(status.success(), "git {args:?} failed");
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(temp.path().join("README.md"), "hello\n").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-m", "init"]);
        temp
    }

    #[tokio::test]
    async fn test_create_and_cleanup() {
        let repo = init_repo();
        let manager = WorktreeManager::new(repo.path().join(".overstory").join("worktrees"));

        let info = manager
            .create_for_agent(repo.path(), "alice", "overstory/alice/bd-1", "main")
            .await
            .unwrap();
        assert!(info.path.exists());
        assert_eq!(info.branch, "overstory/alice/bd-1");
        assert_eq!(info.base_commit.len(), 40);

        assert_eq!(manager.list_on_disk().await.unwrap(), vec!["alice"]);

        manager
            .cleanup_worktree(repo.path(), "alice", Some("overstory/alice/bd-1"), true)
            .await
            .unwrap();
        assert!(!info.path.exists());
        assert!(!GitCli::branch_exists(repo.path(), "overstory/alice/bd-1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_create_twice_returns_existing() {
        let repo = init_repo();
        let manager = WorktreeManager::new(repo.path().join(".overstory").join("worktrees"));

        manager
            .create_for_agent(repo.path(), "alice", "overstory/alice/bd-1", "main")
            .await
            .unwrap();
        let again = manager
            .create_for_agent(repo.path(), "alice", "overstory/alice/bd-1", "main")
            .await
            .unwrap();
        assert_eq!(again.branch, "overstory/alice/bd-1");
    }

    #[tokio::test]
    async fn test_stale_branch_blocks_creation() {
        let repo = init_repo();
        let manager = WorktreeManager::new(repo.path().join(".overstory").join("worktrees"));

        GitCli::create_branch(repo.path(), "overstory/alice/bd-1", "main")
            .await
            .unwrap();
        let err = manager
            .create_for_agent(repo.path(), "alice", "overstory/alice/bd-1", "main")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_list_on_disk_empty_when_missing() {
        let temp = TempDir::new().unwrap();
        let manager = WorktreeManager::new(temp.path().join("nonexistent"));
        assert!(manager.list_on_disk().await.unwrap().is_empty());
    }
}
