//! Process-tree inspection and termination, plus a captured-output
//! subprocess runner with deadlines.

use std::path::Path;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use sysinfo::{ProcessesToUpdate, System};
use tokio::process::Command;

use crate::errors::{Error, Result};

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// All descendant PIDs of `root`, depth-first, excluding `root` itself.
pub fn descendant_pids(root: i32) -> Vec<i32> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut result = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for (pid, process) in system.processes() {
            if process.parent().map(sysinfo::Pid::as_u32) == Some(parent as u32) {
                let child = pid.as_u32() as i32;
                result.push(child);
                frontier.push(child);
            }
        }
    }
    result
}

/// SIGTERM the whole tree rooted at `root`, wait the grace period, then
/// SIGKILL whatever survived. Children are signalled before the root so
/// shells do not respawn their foreground process mid-kill.
pub fn kill_process_tree(root: i32) -> Result<()> {
    let mut targets = descendant_pids(root);
    targets.push(root);

    for pid in &targets {
        // process may already be gone; that is success, not failure
        let _ = kill(Pid::from_raw(*pid), Signal::SIGTERM);
    }

    std::thread::sleep(KILL_GRACE);

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    for pid in &targets {
        if system.process(sysinfo::Pid::from_u32(*pid as u32)).is_some() {
            tracing::debug!(pid, "process survived SIGTERM, sending SIGKILL");
            let _ = kill(Pid::from_raw(*pid), Signal::SIGKILL);
        }
    }
    Ok(())
}

/// Captured result of a subprocess invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run a command, capture stdout/stderr, and enforce an optional deadline.
/// On timeout the child is killed and an `Agent` error returned.
pub async fn run_command(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    deadline: Option<Duration>,
) -> Result<CommandOutput> {
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let future = command.output();
    let output = match deadline {
        Some(limit) => tokio::time::timeout(limit, future).await.map_err(|_| {
            Error::Agent(format!("'{program}' timed out after {}s", limit.as_secs()))
        })?,
        None => future.await,
    }
    .map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::Agent(format!("'{program}' is not installed or not in PATH"))
        } else {
            Error::Agent(format!("failed to run '{program}': {e}"))
        }
    })?;

    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Run a command and feed `input` to its stdin.
pub async fn run_command_with_stdin(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    input: &str,
    deadline: Option<Duration>,
) -> Result<CommandOutput> {
    use std::process::Stdio;
    use tokio::io::AsyncWriteExt;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::Agent(format!("'{program}' is not installed or not in PATH"))
        } else {
            Error::Agent(format!("failed to spawn '{program}': {e}"))
        }
    })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| Error::Agent(format!("cannot write stdin of '{program}': {e}")))?;
        drop(stdin);
    }

    let future = child.wait_with_output();
    let output = match deadline {
        Some(limit) => tokio::time::timeout(limit, future).await.map_err(|_| {
            Error::Agent(format!("'{program}' timed out after {}s", limit.as_secs()))
        })?,
        None => future.await,
    }
    .map_err(|e| Error::Agent(format!("failed to run '{program}': {e}")))?;

    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_captures_stdout() {
        let out = run_command("echo", &["hello"], None, None).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_command_nonzero_exit() {
        let out = run_command("sh", &["-c", "exit 3"], None, None)
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_run_command_missing_binary() {
        let err = run_command("definitely-not-a-real-binary", &[], None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Agent");
        assert!(err.to_string().contains("not installed"));
    }

    #[tokio::test]
    async fn test_run_command_deadline() {
        let err = run_command(
            "sleep",
            &["5"],
            None,
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_run_command_with_stdin() {
        let out = run_command_with_stdin("cat", &[], None, "piped input", None)
            .await
            .unwrap();
        assert_eq!(out.stdout, "piped input");
    }

    #[test]
    fn test_descendant_pids_of_leaf_is_empty() {
        // our own test process has no children at this point in the test
        let pids = descendant_pids(std::process::id() as i32);
        // spawning infrastructure may own threads but not child processes
        assert!(pids.iter().all(|p| *p != std::process::id() as i32));
    }
}
