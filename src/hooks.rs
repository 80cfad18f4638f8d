//! Hook package deployment.
//!
//! Each worktree gets `.claude/hooks.json` plus one shell script per hook
//! event. Every script opens with an environment guard that exits non-zero
//! when `OVERSTORY_AGENT_NAME` is unset, so hooks never fire in a checkout
//! the control plane does not manage.

use std::fs;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use serde::Serialize;

use crate::errors::{Error, Result};
use crate::store::Capability;

/// Hook events wired into the agent CLI.
const HOOK_EVENTS: [(&str, &str); 6] = [
    ("SessionStart", "session-start.sh"),
    ("UserPromptSubmit", "user-prompt-submit.sh"),
    ("PreToolUse", "pre-tool-use.sh"),
    ("PostToolUse", "post-tool-use.sh"),
    ("Stop", "stop.sh"),
    ("PreCompact", "pre-compact.sh"),
];

const ENV_GUARD: &str = r#"# refuse to run outside an overstory-managed worktree
if [ -z "${OVERSTORY_AGENT_NAME:-}" ]; then
    exit 1
fi
"#;

#[derive(Serialize)]
struct HookCommand {
    #[serde(rename = "type")]
    kind: &'static str,
    command: String,
}

#[derive(Serialize)]
struct HookGroup {
    hooks: Vec<HookCommand>,
}

/// Where the hook package lives inside a worktree.
pub fn hooks_dir(worktree: &Path) -> PathBuf {
    worktree.join(".claude").join("hooks")
}

fn hooks_manifest(worktree: &Path) -> PathBuf {
    worktree.join(".claude").join("hooks.json")
}

/// Deploy (or re-deploy) the hook package. Idempotent: scripts and the
/// manifest are overwritten wholesale.
pub fn deploy(worktree: &Path, capability: Capability) -> Result<()> {
    let dir = hooks_dir(worktree);
    fs::create_dir_all(&dir)
        .map_err(|e| Error::Agent(format!("cannot create {}: {e}", dir.display())))?;

    for (event, script) in HOOK_EVENTS {
        let body = script_body(event, capability);
        let path = dir.join(script);
        fs::write(&path, body)
            .map_err(|e| Error::Agent(format!("cannot write {}: {e}", path.display())))?;
        make_executable(&path)?;
    }

    let manifest: serde_json::Value = serde_json::json!({
        "hooks": HOOK_EVENTS
            .iter()
            .map(|(event, script)| {
                (
                    (*event).to_string(),
                    serde_json::to_value(vec![HookGroup {
                        hooks: vec![HookCommand {
                            kind: "command",
                            command: format!(".claude/hooks/{script}"),
                        }],
                    }])
                    .unwrap_or_default(),
                )
            })
            .collect::<serde_json::Map<String, serde_json::Value>>()
    });

    let path = hooks_manifest(worktree);
    fs::write(&path, serde_json::to_string_pretty(&manifest)?)
        .map_err(|e| Error::Agent(format!("cannot write {}: {e}", path.display())))?;
    Ok(())
}

/// Remove the hook package from a worktree.
pub fn uninstall(worktree: &Path) -> Result<bool> {
    let dir = hooks_dir(worktree);
    let manifest = hooks_manifest(worktree);
    let existed = dir.exists() || manifest.exists();
    if dir.exists() {
        fs::remove_dir_all(&dir)
            .map_err(|e| Error::Agent(format!("cannot remove {}: {e}", dir.display())))?;
    }
    if manifest.exists() {
        fs::remove_file(&manifest)
            .map_err(|e| Error::Agent(format!("cannot remove {}: {e}", manifest.display())))?;
    }
    Ok(existed)
}

/// Whether the full package is present.
pub fn is_installed(worktree: &Path) -> bool {
    hooks_manifest(worktree).exists()
        && HOOK_EVENTS
            .iter()
            .all(|(_, script)| hooks_dir(worktree).join(script).exists())
}

fn script_body(event: &str, capability: Capability) -> String {
    let mut body = String::from("#!/bin/sh\n");
    body.push_str(ENV_GUARD);

    match event {
        "SessionStart" => {
            body.push_str("exec overstory prime --agent \"$OVERSTORY_AGENT_NAME\"\n");
        }
        "UserPromptSubmit" => {
            body.push_str(
                "exec overstory mail check --inject --debounce 2000 --agent \"$OVERSTORY_AGENT_NAME\"\n",
            );
        }
        "PreToolUse" => {
            body.push_str(&pre_tool_use_body(capability));
        }
        "PostToolUse" => {
            body.push_str(concat!(
                "payload=$(cat)\n",
                "printf '%s' \"$payload\" | overstory log --stdin --agent \"$OVERSTORY_AGENT_NAME\"\n",
                "# knowledge-store diff extraction after commits\n",
                "case \"$payload\" in\n",
                "    *'\"Bash\"'*'git commit'*)\n",
                "        mulch extract diff >/dev/null 2>&1 || true\n",
                "        ;;\n",
                "esac\n",
                "exit 0\n",
            ));
        }
        "Stop" => {
            body.push_str(concat!(
                "cat | overstory log session-end --stdin --agent \"$OVERSTORY_AGENT_NAME\"\n",
                "mulch learn >/dev/null 2>&1 || true\n",
                "exit 0\n",
            ));
        }
        "PreCompact" => {
            body.push_str(
                "exec overstory log checkpoint --stdin --agent \"$OVERSTORY_AGENT_NAME\"\n",
            );
        }
        _ => {}
    }
    body
}

/// The PreToolUse policy is baked per-capability at deploy time: a
/// non-zero exit blocks the tool call.
fn pre_tool_use_body(capability: Capability) -> String {
    let mut body = String::from(concat!(
        "payload=$(cat)\n",
        "tool=$(printf '%s' \"$payload\" | sed -n 's/.*\"tool_name\"[[:space:]]*:[[:space:]]*\"\\([^\"]*\\)\".*/\\1/p')\n",
        "# git push never happens from an agent worktree\n",
        "case \"$payload\" in\n",
        "    *'git push'*) echo 'blocked: git push is reserved for the merge engine' >&2; exit 2 ;;\n",
        "esac\n",
        "# the control plane owns teamwork; native team/task tools are off\n",
        "case \"$tool\" in\n",
        "    Task|Agent|TeamCreate|TeamDelete) echo \"blocked: $tool (use overstory sling)\" >&2; exit 2 ;;\n",
        "esac\n",
    ));
    if capability.read_only() {
        body.push_str(concat!(
            "case \"$tool\" in\n",
            "    Edit|Write|MultiEdit|NotebookEdit) echo \"blocked: $tool (read-only capability)\" >&2; exit 2 ;;\n",
            "esac\n",
        ));
    }
    // allowed: record the tool_start before the tool runs
    body.push_str(concat!(
        "printf '%s' \"$payload\" | overstory log --stdin --agent \"$OVERSTORY_AGENT_NAME\" || true\n",
        "exit 0\n",
    ));
    body
}

fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let mut perms = fs::metadata(path)
            .map_err(|e| Error::Agent(format!("cannot stat {}: {e}", path.display())))?
            .permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)
            .map_err(|e| Error::Agent(format!("cannot chmod {}: {e}", path.display())))?;
    }
    Ok(())
}
