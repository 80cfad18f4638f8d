//! Git CLI wrapper for worktree, branch, and merge operations.
//!
//! Uses the git CLI directly (rather than libgit2) for mutable operations
//! to ensure compatibility with sparse-checkout, hooks, and other git
//! features.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Low-level git command wrapper.
pub struct GitCli;

impl GitCli {
    /// Execute a git command and return stdout.
    async fn run_git(args: &[&str], cwd: &Path) -> Result<String> {
        debug!(?args, ?cwd, "Running git command");

        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to execute git command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Execute a git command, returning Ok(()) on success.
    async fn run_git_silent(args: &[&str], cwd: &Path) -> Result<()> {
        Self::run_git(args, cwd).await?;
        Ok(())
    }

    /// Get the current branch name.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn current_branch(path: &Path) -> Result<String> {
        Self::run_git(&["rev-parse", "--abbrev-ref", "HEAD"], path).await
    }

    /// Check whether a local branch (or any ref) resolves.
    #[instrument(skip_all, fields(path = %path.display(), branch))]
    pub async fn branch_exists(path: &Path, branch: &str) -> Result<bool> {
        let output = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", branch])
            .current_dir(path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context("Failed to execute git command")?;
        Ok(output.success())
    }

    /// Check if the working directory has uncommitted changes.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn is_dirty(path: &Path) -> Result<bool> {
        let output = Self::run_git(&["status", "--porcelain"], path).await?;
        Ok(!output.is_empty())
    }

    /// Create a new branch from a base.
    #[instrument(skip_all, fields(path = %path.display(), branch, base))]
    pub async fn create_branch(path: &Path, branch: &str, base: &str) -> Result<()> {
        Self::run_git_silent(&["branch", branch, base], path).await
    }

    /// Delete a branch (local).
    #[instrument(skip_all, fields(path = %path.display(), branch, force))]
    pub async fn delete_branch(path: &Path, branch: &str, force: bool) -> Result<()> {
        let flag = if force { "-D" } else { "-d" };
        Self::run_git_silent(&["branch", flag, branch], path).await
    }

    /// Switch the checkout to a branch.
    #[instrument(skip_all, fields(path = %path.display(), branch))]
    pub async fn checkout(path: &Path, branch: &str) -> Result<()> {
        Self::run_git_silent(&["checkout", branch], path).await
    }

    /// `git merge --no-ff <branch>`. Returns Ok(true) on a clean merge and
    /// Ok(false) when the merge stopped on conflicts.
    #[instrument(skip_all, fields(path = %path.display(), branch))]
    pub async fn merge_no_ff(path: &Path, branch: &str, message: &str) -> Result<bool> {
        let output = Command::new("git")
            .args(["merge", "--no-ff", "-m", message, branch])
            .current_dir(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to execute git merge")?;

        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.contains("CONFLICT") || stderr.contains("CONFLICT") || stdout.contains("Automatic merge failed") {
            return Ok(false);
        }
        Err(anyhow!("git merge failed: {}", stderr.trim()))
    }

    /// Abort an in-progress merge.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn merge_abort(path: &Path) -> Result<()> {
        Self::run_git_silent(&["merge", "--abort"], path).await
    }

    /// Files currently in conflict (unmerged).
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn conflicted_files(path: &Path) -> Result<Vec<String>> {
        let output = Self::run_git(&["diff", "--name-only", "--diff-filter=U"], path).await?;
        Ok(lines(&output))
    }

    /// Take the incoming side of a conflicted file.
    #[instrument(skip_all, fields(path = %path.display(), file))]
    pub async fn checkout_theirs(path: &Path, file: &str) -> Result<()> {
        Self::run_git_silent(&["checkout", "--theirs", "--", file], path).await
    }

    /// Stage one path.
    #[instrument(skip_all, fields(path = %path.display(), file))]
    pub async fn add(path: &Path, file: &str) -> Result<()> {
        Self::run_git_silent(&["add", "--", file], path).await
    }

    /// Stage everything.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn add_all(path: &Path) -> Result<()> {
        Self::run_git_silent(&["add", "-A"], path).await
    }

    /// Commit staged changes.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn commit(path: &Path, message: &str) -> Result<()> {
        Self::run_git_silent(&["commit", "--no-verify", "-m", message], path).await
    }

    /// Files modified on `branch` relative to the merge base with `target`
    /// (`git diff --name-only target...branch`).
    #[instrument(skip_all, fields(path = %path.display(), target, branch))]
    pub async fn diff_name_only(path: &Path, target: &str, branch: &str) -> Result<Vec<String>> {
        let range = format!("{target}...{branch}");
        let output = Self::run_git(&["diff", "--name-only", &range], path).await?;
        Ok(lines(&output))
    }

    /// Full patch for one file across the same range; feeds the AI
    /// resolver tiers.
    #[instrument(skip_all, fields(path = %path.display(), target, branch, file))]
    pub async fn diff_for_file(
        path: &Path,
        target: &str,
        branch: &str,
        file: &str,
    ) -> Result<String> {
        let range = format!("{target}...{branch}");
        Self::run_git(&["diff", &range, "--", file], path).await
    }

    /// All `overstory/*` branch heads.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn overstory_refs(path: &Path) -> Result<Vec<String>> {
        let output = Self::run_git(
            &[
                "for-each-ref",
                "--format=%(refname:short)",
                "refs/heads/overstory/",
            ],
            path,
        )
        .await?;
        Ok(lines(&output))
    }

    /// Add a worktree.
    #[instrument(skip_all, fields(repo_path = %repo_path.display(), worktree_path = %worktree_path.display(), branch))]
    pub async fn add_worktree(
        repo_path: &Path,
        worktree_path: &Path,
        branch: &str,
        create_branch: bool,
        base: Option<&str>,
    ) -> Result<()> {
        let worktree_str = worktree_path.to_string_lossy();

        if create_branch {
            let base_ref = base.unwrap_or("HEAD");
            Self::run_git_silent(
                &["worktree", "add", "-b", branch, &worktree_str, base_ref],
                repo_path,
            )
            .await
        } else {
            Self::run_git_silent(&["worktree", "add", &worktree_str, branch], repo_path).await
        }
    }

    /// Remove a worktree.
    #[instrument(skip_all, fields(repo_path = %repo_path.display(), worktree_path = %worktree_path.display(), force))]
    pub async fn remove_worktree(
        repo_path: &Path,
        worktree_path: &Path,
        force: bool,
    ) -> Result<()> {
        let worktree_str = worktree_path.to_string_lossy();

        if force {
            Self::run_git_silent(&["worktree", "remove", "--force", &worktree_str], repo_path).await
        } else {
            Self::run_git_silent(&["worktree", "remove", &worktree_str], repo_path).await
        }
    }

    /// Prune worktree metadata.
    #[instrument(skip_all, fields(repo_path = %repo_path.display()))]
    pub async fn prune_worktrees(repo_path: &Path) -> Result<()> {
        Self::run_git_silent(&["worktree", "prune"], repo_path).await
    }

    /// List all worktrees.
    #[instrument(skip_all, fields(repo_path = %repo_path.display()))]
    pub async fn list_worktrees(repo_path: &Path) -> Result<Vec<WorktreeEntry>> {
        let output = Self::run_git(&["worktree", "list", "--porcelain"], repo_path).await?;

        let mut entries = Vec::new();
        let mut current: Option<WorktreeEntry> = None;

        for line in output.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                if let Some(entry) = current.take() {
                    entries.push(entry);
                }
                current = Some(WorktreeEntry {
                    path: path.to_string(),
                    branch: None,
                    head: None,
                    bare: false,
                });
            } else if let Some(head) = line.strip_prefix("HEAD ") {
                if let Some(ref mut entry) = current {
                    entry.head = Some(head.to_string());
                }
            } else if let Some(branch) = line.strip_prefix("branch ") {
                if let Some(ref mut entry) = current {
                    entry.branch = Some(branch.to_string());
                }
            } else if line == "bare" {
                if let Some(ref mut entry) = current {
                    entry.bare = true;
                }
            }
        }
        if let Some(entry) = current {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Read a file's content at a ref (`git show ref:path`).
    #[instrument(skip_all, fields(path = %path.display(), reference, file))]
    pub async fn show_file(path: &Path, reference: &str, file: &str) -> Result<String> {
        Self::run_git(&["show", &format!("{reference}:{file}")], path).await
    }

    /// Head commit of the checkout.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn head_commit(path: &Path) -> Result<String> {
        Self::run_git(&["rev-parse", "HEAD"], path).await
    }
}

fn lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// A single worktree from `git worktree list --porcelain`.
#[derive(Debug, Clone)]
pub struct WorktreeEntry {
    pub path: String,
    pub branch: Option<String>,
    pub head: Option<String>,
    pub bare: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
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
    async fn test_current_branch_and_head() {
        let repo = init_repo();
        assert_eq!(GitCli::current_branch(repo.path()).await.unwrap(), "main");
        assert_eq!(GitCli::head_commit(repo.path()).await.unwrap().len(), 40);
    }

    #[tokio::test]
    async fn test_branch_exists() {
        let repo = init_repo();
        assert!(GitCli::branch_exists(repo.path(), "main").await.unwrap());
        assert!(!GitCli::branch_exists(repo.path(), "overstory/alice/bd-1")
            .await
            .unwrap());

        GitCli::create_branch(repo.path(), "overstory/alice/bd-1", "main")
            .await
            .unwrap();
        assert!(GitCli::branch_exists(repo.path(), "overstory/alice/bd-1")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_diff_name_only_across_branches() {
        let repo = init_repo();
        GitCli::create_branch(repo.path(), "overstory/alice/bd-1", "main")
            .await
            .unwrap();
        GitCli::checkout(repo.path(), "overstory/alice/bd-1")
            .await
            .unwrap();
        std::fs::write(repo.path().join("src.rs"), "fn main() {}\n").unwrap();
        GitCli::add_all(repo.path()).await.unwrap();
        GitCli::commit(repo.path(), "add src").await.unwrap();
        GitCli::checkout(repo.path(), "main").await.unwrap();

        let files = GitCli::diff_name_only(repo.path(), "main", "overstory/alice/bd-1")
            .await
            .unwrap();
        assert_eq!(files, vec!["src.rs"]);
    }

    #[tokio::test]
    async fn test_merge_no_ff_clean() {
        let repo = init_repo();
        GitCli::create_branch(repo.path(), "feature", "main")
            .await
            .unwrap();
        GitCli::checkout(repo.path(), "feature").await.unwrap();
        std::fs::write(repo.path().join("a.rs"), "a\n").unwrap();
        GitCli::add_all(repo.path()).await.unwrap();
        GitCli::commit(repo.path(), "a").await.unwrap();
        GitCli::checkout(repo.path(), "main").await.unwrap();

        let clean = GitCli::merge_no_ff(repo.path(), "feature", "merge feature")
            .await
            .unwrap();
        assert!(clean);
        assert!(repo.path().join("a.rs").exists());
    }

    #[tokio::test]
    async fn test_merge_no_ff_conflict_reports_files() {
        let repo = init_repo();
        GitCli::create_branch(repo.path(), "feature", "main")
            .await
            .unwrap();

        // both sides edit README.md
        std::fs::write(repo.path().join("README.md"), "main version\n").unwrap();
        GitCli::add_all(repo.path()).await.unwrap();
        GitCli::commit(repo.path(), "main edit").await.unwrap();

        GitCli::checkout(repo.path(), "feature").await.unwrap();
        std::fs::write(repo.path().join("README.md"), "feature version\n").unwrap();
        GitCli::add_all(repo.path()).await.unwrap();
        GitCli::commit(repo.path(), "feature edit").await.unwrap();
        GitCli::checkout(repo.path(), "main").await.unwrap();

        let clean = GitCli::merge_no_ff(repo.path(), "feature", "merge feature")
            .await
            .unwrap();
        assert!(!clean);

        let conflicted = GitCli::conflicted_files(repo.path()).await.unwrap();
        assert_eq!(conflicted, vec!["README.md"]);

        // content-wins path: take theirs, stage, commit
        GitCli::checkout_theirs(repo.path(), "README.md")
            .await
            .unwrap();
        GitCli::add(repo.path(), "README.md").await.unwrap();
        GitCli::commit(repo.path(), "resolve").await.unwrap();
        let content = std::fs::read_to_string(repo.path().join("README.md")).unwrap();
        assert_eq!(content, "feature version\n");
    }

    #[tokio::test]
    async fn test_overstory_refs() {
        let repo = init_repo();
        GitCli::create_branch(repo.path(), "overstory/a/bd-1", "main")
            .await
            .unwrap();
        GitCli::create_branch(repo.path(), "overstory/b/bd-2", "main")
            .await
            .unwrap();
        GitCli::create_branch(repo.path(), "unrelated", "main")
            .await
            .unwrap();

        let refs = GitCli::overstory_refs(repo.path()).await.unwrap();
        assert_eq!(refs.len(), 2);
        assert!(refs.iter().all(|r| r.starts_with("overstory/")));
    }

    #[tokio::test]
    async fn test_worktree_add_list_remove() {
        let repo = init_repo();
        let worktree_path = repo.path().join(".overstory").join("worktrees").join("alice");

        GitCli::add_worktree(
            repo.path(),
            &worktree_path,
            "overstory/alice/bd-1",
            true,
            Some("main"),
        )
        .await
        .unwrap();

        let entries = GitCli::list_worktrees(repo.path()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries
            .iter()
            .any(|e| e.branch.as_deref() == Some("refs/heads/overstory/alice/bd-1")));

        GitCli::remove_worktree(repo.path(), &worktree_path, true)
            .await
            .unwrap();
        GitCli::prune_worktrees(repo.path()).await.unwrap();
        let entries = GitCli::list_worktrees(repo.path()).await.unwrap();
        assert_eq!(entries.len(), 1);
    }
}
