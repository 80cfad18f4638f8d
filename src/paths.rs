//! Filesystem layout of `{project_root}/.overstory/` and the tiny
//! single-writer pointer files that live inside it.
//!
//! Pointer files (`current-run.txt`, `session-branch.txt`) are updated with
//! a write-temp-then-rename pattern so concurrent readers never observe a
//! partial value.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::errors::{Error, Result};

/// Directory name under the project root that holds all persistent state.
pub const OVERSTORY_DIR: &str = ".overstory";

/// Resolved home of a project's overstory state.
#[derive(Debug, Clone)]
pub struct OverstoryHome {
    root: PathBuf,
}

impl OverstoryHome {
    /// Wrap an already-known project root.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Walk up from `start` looking for a `.overstory/` directory.
    ///
    /// Agents run inside git worktrees whose checkout does not contain
    /// `.overstory/`; when the walk fails, fall back to the repository's
    /// common git directory so worktree processes resolve to the primary
    /// checkout.
    pub fn discover(start: &Path) -> Result<Self> {
        let mut dir = Some(start.to_path_buf());
        while let Some(d) = dir {
            if d.join(OVERSTORY_DIR).is_dir() {
                return Ok(Self { root: d });
            }
            dir = d.parent().map(Path::to_path_buf);
        }

        if let Some(root) = git_primary_root(start) {
            if root.join(OVERSTORY_DIR).is_dir() {
                return Ok(Self { root });
            }
        }

        Err(Error::Config(format!(
            "no {} directory found above {} (run `overstory init` first)",
            OVERSTORY_DIR,
            start.display()
        )))
    }

    /// The project root this home belongs to.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `{root}/.overstory`
    pub fn dir(&self) -> PathBuf {
        self.root.join(OVERSTORY_DIR)
    }

    /// Create the full on-disk skeleton. Idempotent.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.dir(),
            self.pending_nudges_dir(),
            self.agents_dir(),
            self.specs_dir(),
            self.worktrees_dir(),
            self.logs_dir(),
            self.agent_defs_dir(),
        ] {
            fs::create_dir_all(&dir)
                .map_err(|e| Error::Config(format!("cannot create {}: {e}", dir.display())))?;
        }
        Ok(())
    }

    pub fn config_file(&self) -> PathBuf {
        self.dir().join("config.yaml")
    }

    pub fn local_config_file(&self) -> PathBuf {
        self.dir().join("config.local.yaml")
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.dir().join("agent-manifest.json")
    }

    pub fn agent_defs_dir(&self) -> PathBuf {
        self.dir().join("agent-defs")
    }

    pub fn sessions_db(&self) -> PathBuf {
        self.dir().join("sessions.db")
    }

    pub fn events_db(&self) -> PathBuf {
        self.dir().join("events.db")
    }

    pub fn mail_db(&self) -> PathBuf {
        self.dir().join("mail.db")
    }

    pub fn metrics_db(&self) -> PathBuf {
        self.dir().join("metrics.db")
    }

    pub fn merge_queue_db(&self) -> PathBuf {
        self.dir().join("merge-queue.db")
    }

    /// Legacy JSON session file imported on first SQL open.
    pub fn legacy_sessions_file(&self) -> PathBuf {
        self.dir().join("sessions.json")
    }

    pub fn current_run_file(&self) -> PathBuf {
        self.dir().join("current-run.txt")
    }

    pub fn session_branch_file(&self) -> PathBuf {
        self.dir().join("session-branch.txt")
    }

    pub fn mail_check_state_file(&self) -> PathBuf {
        self.dir().join("mail-check-state.json")
    }

    pub fn nudge_state_file(&self) -> PathBuf {
        self.dir().join("nudge-state.json")
    }

    pub fn merge_history_file(&self) -> PathBuf {
        self.dir().join("merge-history.json")
    }

    pub fn pending_nudges_dir(&self) -> PathBuf {
        self.dir().join("pending-nudges")
    }

    pub fn pending_nudge_file(&self, agent: &str) -> PathBuf {
        self.pending_nudges_dir().join(format!("{agent}.json"))
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.dir().join("agents")
    }

    pub fn identity_file(&self, agent: &str) -> PathBuf {
        self.agents_dir().join(agent).join("identity.json")
    }

    pub fn checkpoint_file(&self, agent: &str) -> PathBuf {
        self.agents_dir().join(agent).join("checkpoint.json")
    }

    pub fn specs_dir(&self) -> PathBuf {
        self.dir().join("specs")
    }

    pub fn spec_file(&self, bead_id: &str) -> PathBuf {
        self.specs_dir().join(format!("{bead_id}.md"))
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.dir().join("worktrees")
    }

    pub fn worktree_dir(&self, agent: &str) -> PathBuf {
        self.worktrees_dir().join(agent)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.dir().join("logs")
    }
}

/// Read a pointer file, returning `None` when absent or empty.
pub fn read_pointer(path: &Path) -> Option<String> {
    let value = fs::read_to_string(path).ok()?;
    let value = value.trim().to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Write a pointer file atomically (temp file + rename).
pub fn write_pointer(path: &Path, value: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Config(format!("pointer path has no parent: {}", path.display())))?;
    fs::create_dir_all(parent)
        .map_err(|e| Error::Config(format!("cannot create {}: {e}", parent.display())))?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, format!("{value}\n"))
        .map_err(|e| Error::Config(format!("cannot write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| Error::Config(format!("cannot rename {}: {e}", tmp.display())))?;
    Ok(())
}

/// Remove a pointer file. Missing files are not an error.
pub fn clear_pointer(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Config(format!(
            "cannot remove {}: {e}",
            path.display()
        ))),
    }
}

/// Resolve the primary checkout root through `git rev-parse --git-common-dir`.
fn git_primary_root(start: &Path) -> Option<PathBuf> {
    let output = Command::new("git")
        .args(["rev-parse", "--git-common-dir"])
        .current_dir(start)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let common = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let common_path = if Path::new(&common).is_absolute() {
        PathBuf::from(common)
    } else {
        start.join(common)
    };
    // common dir is `{root}/.git`
    common_path.parent().map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_discover_walks_up() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join(OVERSTORY_DIR)).unwrap();
        let nested = root.join("src").join("deep");
        fs::create_dir_all(&nested).unwrap();

        let home = OverstoryHome::discover(&nested).unwrap();
        assert_eq!(home.root(), root);
    }

    #[test]
    fn test_discover_missing_is_config_error() {
        let temp = TempDir::new().unwrap();
        let err = OverstoryHome::discover(temp.path()).unwrap_err();
        assert_eq!(err.kind(), "Config");
    }

    #[test]
    fn test_pointer_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("current-run.txt");

        assert!(read_pointer(&path).is_none());
        write_pointer(&path, "run-42").unwrap();
        assert_eq!(read_pointer(&path).as_deref(), Some("run-42"));

        clear_pointer(&path).unwrap();
        assert!(read_pointer(&path).is_none());
        // clearing twice is fine
        clear_pointer(&path).unwrap();
    }

    #[test]
    fn test_pointer_write_leaves_no_temp_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("session-branch.txt");
        write_pointer(&path, "main").unwrap();
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_layout_paths() {
        let home = OverstoryHome::at("/work/project");
        assert_eq!(
            home.pending_nudge_file("builder-1"),
            PathBuf::from("/work/project/.overstory/pending-nudges/builder-1.json")
        );
        assert_eq!(
            home.identity_file("alice"),
            PathBuf::from("/work/project/.overstory/agents/alice/identity.json")
        );
        assert_eq!(
            home.spec_file("bd-7"),
            PathBuf::from("/work/project/.overstory/specs/bd-7.md")
        );
    }

    #[test]
    fn test_ensure_layout_idempotent() {
        let temp = TempDir::new().unwrap();
        let home = OverstoryHome::at(temp.path());
        home.ensure_layout().unwrap();
        home.ensure_layout().unwrap();
        assert!(home.pending_nudges_dir().is_dir());
        assert!(home.worktrees_dir().is_dir());
    }
}
