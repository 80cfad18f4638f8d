//! Context priming.
//!
//! Builds the structured text packet handed to an agent at session start
//! (or mid-session, after compaction). Sections: project summary, agent
//! manifest, recent sessions, knowledge-store expertise, the activation
//! block binding the bead, and (in compact mode) the saved checkpoint.

use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agents::manifest::Manifest;
use crate::agents::process;
use crate::config::{Config, PrimeFormat};
use crate::errors::Result;
use crate::paths::OverstoryHome;
use crate::store::{SessionState, SessionStore};

/// How many recent sessions the packet lists.
const RECENT_SESSIONS: usize = 8;

/// Deadline for the knowledge-store subprocess.
const MULCH_DEADLINE: Duration = Duration::from_secs(10);

/// Saved by the PreCompact hook; replayed into the post-compaction prime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub progress_summary: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub pending_work: Vec<String>,
    #[serde(default)]
    pub current_branch: Option<String>,
}

impl Checkpoint {
    pub fn save(&self, home: &OverstoryHome, agent: &str) -> Result<()> {
        let path = home.checkpoint_file(agent);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                crate::errors::Error::Agent(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        fs::write(&path, serde_json::to_string_pretty(self)?).map_err(|e| {
            crate::errors::Error::Agent(format!("cannot write {}: {e}", path.display()))
        })?;
        Ok(())
    }

    pub fn load(home: &OverstoryHome, agent: &str) -> Option<Checkpoint> {
        let raw = fs::read_to_string(home.checkpoint_file(agent)).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

/// Assemble the prime packet for an agent.
pub async fn build_prime(
    home: &OverstoryHome,
    config: &Config,
    agent: Option<&str>,
    compact: bool,
) -> Result<String> {
    let mut packet = String::new();

    packet.push_str("# Overstory Context\n\n");
    packet.push_str("## Project\n");
    packet.push_str(&format!(
        "- name: {}\n- canonical branch: {}\n- max concurrent agents: {}\n- max spawn depth: {}\n\n",
        config.project.name,
        config.project.canonical_branch,
        config.agents.max_concurrent,
        config.agents.max_depth,
    ));

    packet.push_str("## Capabilities\n");
    let manifest = Manifest::load(home)?;
    let mut roles: Vec<_> = manifest.roles.iter().collect();
    roles.sort_by(|a, b| a.0.cmp(b.0));
    for (role, def) in roles {
        packet.push_str(&format!(
            "- {role}: model={}, canSpawn={}\n",
            def.model.as_deref().unwrap_or("default"),
            def.can_spawn,
        ));
    }
    packet.push('\n');

    packet.push_str("## Recent sessions\n");
    match SessionStore::open(&home.sessions_db()) {
        Ok(store) => {
            let mut sessions = store.get_all()?;
            sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            sessions.truncate(RECENT_SESSIONS);
            if sessions.is_empty() {
                packet.push_str("(none)\n");
            }
            for session in sessions {
                packet.push_str(&format!(
                    "- {} [{}] {} on {}\n",
                    session.agent_name, session.capability, session.state, session.branch_name,
                ));
            }
            store.close();
        }
        Err(_) => packet.push_str("(session store unavailable)\n"),
    }
    packet.push('\n');

    // expertise priming is skipped on compaction: the agent already has
    // domain context and the packet must stay small
    if config.mulch.enabled && !compact {
        if let Some(expertise) = mulch_prime(config).await {
            packet.push_str("## Expertise\n");
            packet.push_str(&expertise);
            packet.push('\n');
        }
    }

    if let Some(agent) = agent {
        packet.push_str(&activation_section(home, agent));
        if compact {
            if let Some(checkpoint) = Checkpoint::load(home, agent) {
                packet.push_str(&checkpoint_section(&checkpoint));
            }
        }
    }

    Ok(packet)
}

fn activation_section(home: &OverstoryHome, agent: &str) -> String {
    let mut section = String::from("## Activation\n");
    section.push_str(&format!("You are agent `{agent}`.\n"));

    if let Ok(store) = SessionStore::open(&home.sessions_db()) {
        if let Ok(Some(session)) = store.get_by_name(agent) {
            if !session.bead_id.is_empty() {
                section.push_str(&format!(
                    "Your bound task is `{}`; the brief is at .overstory/specs/{}.md.\n",
                    session.bead_id, session.bead_id,
                ));
            }
            section.push_str(&format!(
                "Work only in your worktree on branch `{}`. Send `worker_done` mail to `{}` when finished.\n",
                session.branch_name,
                session.parent_agent.as_deref().unwrap_or("overstory"),
            ));
            if session.state == SessionState::Booting {
                section.push_str("Check your mail before starting.\n");
            }
        }
        store.close();
    }
    section.push('\n');
    section
}

fn checkpoint_section(checkpoint: &Checkpoint) -> String {
    let mut section = String::from("## Checkpoint (pre-compaction)\n");
    if !checkpoint.progress_summary.is_empty() {
        section.push_str(&format!("Progress: {}\n", checkpoint.progress_summary));
    }
    if !checkpoint.files_modified.is_empty() {
        section.push_str(&format!(
            "Files modified: {}\n",
            checkpoint.files_modified.join(", ")
        ));
    }
    if !checkpoint.pending_work.is_empty() {
        section.push_str("Pending:\n");
        for item in &checkpoint.pending_work {
            section.push_str(&format!("- {item}\n"));
        }
    }
    if let Some(branch) = &checkpoint.current_branch {
        section.push_str(&format!("Current branch: {branch}\n"));
    }
    section.push('\n');
    section
}

/// Expertise prime from the knowledge store. Best-effort: a missing or
/// failing `mulch` yields no section rather than a failed prime.
async fn mulch_prime(config: &Config) -> Option<String> {
    let format = match config.mulch.prime_format {
        PrimeFormat::Markdown => "markdown",
        PrimeFormat::Xml => "xml",
        PrimeFormat::Json => "json",
    };
    let domains = config.mulch.domains.join(",");
    let mut args = vec!["prime", "--format", format];
    if !domains.is_empty() {
        args.push("--domains");
        args.push(&domains);
    }

    let output = process::run_command("mulch", &args, None, Some(MULCH_DEADLINE))
        .await
        .ok()?;
    if !output.success() || output.stdout.trim().is_empty() {
        return None;
    }
    Some(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, OverstoryHome, Config) {
        let temp = TempDir::new().unwrap();
        let home = OverstoryHome::at(temp.path());
        home.ensure_layout().unwrap();
        let mut config = Config::default();
        config.project.name = "demo".to_string();
        (temp, home, config)
    }

    #[tokio::test]
    async fn test_prime_has_core_sections() {
        let (_temp, home, config) = setup();
        let packet = build_prime(&home, &config, None, false).await.unwrap();
        assert!(packet.contains("## Project"));
        assert!(packet.contains("- name: demo"));
        assert!(packet.contains("## Capabilities"));
        assert!(packet.contains("## Recent sessions"));
    }

    #[tokio::test]
    async fn test_activation_includes_bead() {
        let (_temp, home, config) = setup();
        let store = SessionStore::open(&home.sessions_db()).unwrap();
        let now = chrono::Utc::now();
        store
            .upsert(&crate::store::Session {
                id: "s1".to_string(),
                agent_name: "alice".to_string(),
                capability: crate::store::Capability::Builder,
                worktree_path: "/tmp".into(),
                branch_name: "overstory/alice/bd-7".to_string(),
                bead_id: "bd-7".to_string(),
                tmux_session: "overstory-demo-alice".to_string(),
                state: SessionState::Booting,
                pid: None,
                parent_agent: Some("lead-1".to_string()),
                depth: 1,
                run_id: None,
                started_at: now,
                last_activity: now,
                escalation_level: 0,
                stalled_since: None,
            })
            .unwrap();
        store.close();

        let packet = build_prime(&home, &config, Some("alice"), false)
            .await
            .unwrap();
        assert!(packet.contains("## Activation"));
        assert!(packet.contains("bd-7"));
        assert!(packet.contains("overstory/alice/bd-7"));
        assert!(packet.contains("lead-1"));
    }

    #[tokio::test]
    async fn test_compact_mode_replays_checkpoint() {
        let (_temp, home, config) = setup();
        Checkpoint {
            progress_summary: "half done".to_string(),
            files_modified: vec!["src/a.rs".to_string()],
            pending_work: vec!["write tests".to_string()],
            current_branch: Some("overstory/alice/bd-7".to_string()),
        }
        .save(&home, "alice")
        .unwrap();

        let packet = build_prime(&home, &config, Some("alice"), true)
            .await
            .unwrap();
        assert!(packet.contains("## Checkpoint"));
        assert!(packet.contains("half done"));
        assert!(packet.contains("write tests"));
    }

    #[tokio::test]
    async fn test_compact_without_checkpoint_is_fine() {
        let (_temp, home, config) = setup();
        let packet = build_prime(&home, &config, Some("ghost"), true)
            .await
            .unwrap();
        assert!(!packet.contains("## Checkpoint"));
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let (_temp, home, _config) = setup();
        let checkpoint = Checkpoint {
            progress_summary: "x".to_string(),
            ..Checkpoint::default()
        };
        checkpoint.save(&home, "alice").unwrap();
        let loaded = Checkpoint::load(&home, "alice").unwrap();
        assert_eq!(loaded.progress_summary, "x");
    }
}
