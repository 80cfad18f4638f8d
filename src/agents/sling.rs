//! The scheduler: admit, validate, and spawn an agent bound to a task
//! inside a fresh worktree and tmux pane.
//!
//! Validation gates run in a fixed order and the first failure returns a
//! structured error with no side effects. Only after every gate passes
//! does the admit choreography touch the filesystem, git, or tmux.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use super::manifest::Manifest;
use super::provider::ProviderCommand;
use super::tmux::{wait_for_tui_ready_with, TmuxClient, TuiReadyParams};
use super::{identity, validate_agent_name, worker_branch};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::git::WorktreeManager;
use crate::hooks;
use crate::paths::{self, OverstoryHome};
use crate::store::{
    now_iso, Capability, EventStore, EventType, NewEvent, Session, SessionState, SessionStore,
};

/// Environment variable carrying the agent's name into its pane; every
/// hook script guards on it.
pub const AGENT_NAME_ENV: &str = "OVERSTORY_AGENT_NAME";

/// Pause after TUI-ready before the beacon, and between the beacon's
/// follow-up submit keypresses.
const BEACON_SETTLE: Duration = Duration::from_secs(1);

/// A request to admit one agent.
#[derive(Debug, Clone)]
pub struct SlingRequest {
    pub capability: Capability,
    pub name: String,
    /// Path to a task brief copied into `.overstory/specs/{bead}.md`.
    pub spec: Option<PathBuf>,
    /// Optional comma-separated edit-scope narrowing, recorded in the
    /// task overlay.
    pub files: Vec<String>,
    pub parent: Option<String>,
    pub depth: Option<u32>,
    pub force_hierarchy: bool,
    pub bead_id: Option<String>,
}

pub struct Sling<'a> {
    home: &'a OverstoryHome,
    config: &'a Config,
    tmux: &'a dyn TmuxClient,
    /// Tests override the observed UID; production uses the real one.
    uid_override: Option<u32>,
    settle: Duration,
    tui_params: TuiReadyParams,
}

impl<'a> Sling<'a> {
    pub fn new(home: &'a OverstoryHome, config: &'a Config, tmux: &'a dyn TmuxClient) -> Self {
        Self {
            home,
            config,
            tmux,
            uid_override: None,
            settle: BEACON_SETTLE,
            tui_params: TuiReadyParams::default(),
        }
    }

    /// Override the observed UID (test support).
    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid_override = Some(uid);
        self
    }

    /// Collapse the spawn choreography delays (test support).
    pub fn with_fast_timings(mut self) -> Self {
        self.settle = Duration::from_millis(1);
        self.tui_params = TuiReadyParams {
            timeout: Duration::from_millis(50),
            poll: Duration::from_millis(5),
            stable_polls: 2,
        };
        self
    }

    fn effective_uid(&self) -> u32 {
        self.uid_override
            .unwrap_or_else(|| nix::unistd::geteuid().as_raw())
    }

    /// Run every validation gate in order. No side effects.
    pub async fn validate(&self, request: &SlingRequest) -> Result<()> {
        // 1. the wrapped AI CLI rejects root
        if self.effective_uid() == 0 {
            return Err(Error::Agent(
                "refusing to sling as root: the agent CLI will not run as UID 0; \
                 switch to the operator user"
                    .to_string(),
            ));
        }

        validate_agent_name(&request.name)?;

        let sessions = SessionStore::open(&self.home.sessions_db())?;

        // 2. parent must exist and be live enough to receive worker_done
        if let Some(parent) = &request.parent {
            match sessions.get_by_name(parent)? {
                None => {
                    sessions.close();
                    return Err(Error::validation(
                        "parent",
                        format!("no session named '{parent}'"),
                    ));
                }
                Some(session)
                    if !matches!(
                        session.state,
                        SessionState::Booting | SessionState::Working
                    ) =>
                {
                    sessions.close();
                    return Err(Error::validation(
                        "parent",
                        format!("'{parent}' is {}, not booting/working", session.state),
                    ));
                }
                Some(_) => {}
            }
        }

        // 3. hierarchy depth
        let depth = request.depth.unwrap_or(0);
        if depth > self.config.agents.max_depth && !request.force_hierarchy {
            sessions.close();
            return Err(Error::validation(
                "depth",
                format!(
                    "{depth} exceeds agents.maxDepth ({}); pass --force-hierarchy to override",
                    self.config.agents.max_depth
                ),
            ));
        }

        // 4. fleet size
        let active = sessions.get_active()?;
        if active.len() >= self.config.agents.max_concurrent {
            sessions.close();
            return Err(Error::validation(
                "maxConcurrent",
                format!(
                    "{} agents already active (limit {})",
                    active.len(),
                    self.config.agents.max_concurrent
                ),
            ));
        }

        // 5. name unique across active sessions
        if active.iter().any(|s| s.agent_name == request.name) {
            sessions.close();
            return Err(Error::validation(
                "name",
                format!("agent '{}' already has a live session", request.name),
            ));
        }
        sessions.close();

        // 6. bead workable
        if let Some(bead_id) = &request.bead_id {
            if self.config.beads.enabled && !crate::beads::is_workable(bead_id).await? {
                return Err(Error::validation(
                    "bead",
                    format!("bead '{bead_id}' is not open or in_progress"),
                ));
            }
        }

        Ok(())
    }

    /// Validate and, on admit, run the spawn choreography. Returns the
    /// inserted session.
    pub async fn sling(&self, request: &SlingRequest) -> Result<Session> {
        self.validate(request).await?;
        self.warn_lead_without_scout(request);

        let bead_id = request.bead_id.clone().unwrap_or_default();
        let repo = self.config.project_root();

        // worktree + branch; supervisors and coordinators stay on the
        // canonical branch in the primary checkout
        let (worktree_path, branch_name) = if request.capability.uses_canonical_branch() {
            (repo.clone(), self.config.project.canonical_branch.clone())
        } else {
            let manager = WorktreeManager::new(
                self.config
                    .worktrees
                    .base_dir
                    .clone()
                    .unwrap_or_else(|| self.home.worktrees_dir()),
            );
            // a ref segment cannot be empty; unbound agents get a
            // placeholder bead slot
            let branch_bead = if bead_id.is_empty() { "adhoc" } else { &bead_id };
            let branch = worker_branch(&request.name, branch_bead);
            let info = manager
                .create_for_agent(
                    &repo,
                    &request.name,
                    &branch,
                    &self.config.project.canonical_branch,
                )
                .await
                .map_err(|e| Error::Worktree(e.to_string()))?;
            (info.path, info.branch)
        };

        // 1. hook package (idempotent)
        hooks::deploy(&worktree_path, request.capability)?;

        // 2. identity record on first run
        identity::load_or_create(
            self.home,
            &request.name,
            request.capability,
            &self.config.mulch.domains,
        )?;
        identity::record_session(self.home, &request.name)?;

        // 3. model resolution
        let manifest = Manifest::load(self.home)?;
        let provider_command = ProviderCommand::for_capability(
            self.config,
            request.capability,
            manifest.default_model(request.capability),
        );

        // 4. task brief + overlay
        if let Some(spec_path) = &request.spec {
            if !bead_id.is_empty() {
                let brief = std::fs::read_to_string(spec_path).map_err(|e| {
                    Error::validation("spec", format!("cannot read {}: {e}", spec_path.display()))
                })?;
                std::fs::write(self.home.spec_file(&bead_id), brief)
                    .map_err(|e| Error::Agent(format!("cannot write spec: {e}")))?;
            }
        }
        self.write_task_overlay(&worktree_path, request, &bead_id, &branch_name)?;

        // 5. spawn the pane
        let session_name = self.config.tmux_session_name(&request.name);
        let definition = self.capability_definition(request.capability)?;
        let command = provider_command.interactive_shell_line(&definition);

        let mut env: HashMap<String, String> = provider_command.env.clone();
        env.insert(AGENT_NAME_ENV.to_string(), request.name.clone());

        self.tmux.create_session(
            &session_name,
            &worktree_path.to_string_lossy(),
            &command,
            &env,
        )?;

        // 6. wait for the TUI, then let it settle
        if !wait_for_tui_ready_with(self.tmux, &session_name, &self.tui_params)? {
            warn!(session = %session_name, "pane content never stabilized; sending beacon anyway");
        }
        tokio::time::sleep(self.settle).await;

        // 7. startup beacon plus two explicit submits
        let beacon = self.beacon_line(request, &bead_id);
        self.tmux.send_keys(&session_name, &beacon, true)?;
        tokio::time::sleep(self.settle).await;
        self.tmux.send_enter(&session_name)?;
        tokio::time::sleep(self.settle).await;
        self.tmux.send_enter(&session_name)?;

        // 8. session row
        let pid = self.tmux.pane_pid(&session_name).ok().flatten();
        let now = chrono::Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            agent_name: request.name.clone(),
            capability: request.capability,
            worktree_path,
            branch_name,
            bead_id: bead_id.clone(),
            tmux_session: session_name,
            state: SessionState::Booting,
            pid: pid.map(i64::from),
            parent_agent: request.parent.clone(),
            depth: request.depth.unwrap_or(0),
            run_id: paths::read_pointer(&self.home.current_run_file()),
            started_at: now,
            last_activity: now,
            escalation_level: 0,
            stalled_since: None,
        };
        let sessions = SessionStore::open(&self.home.sessions_db())?;
        sessions.upsert(&session)?;
        sessions.close();

        self.record_spawn_event(&session);
        info!(
            agent = %session.agent_name,
            capability = %session.capability,
            bead = %session.bead_id,
            "agent admitted"
        );

        // stagger consecutive admits so a burst of slings does not slam
        // the provider all at once
        tokio::time::sleep(Duration::from_millis(self.config.agents.stagger_delay_ms)).await;

        Ok(session)
    }

    /// Advisory only: a lead spawning builders before any scout usually
    /// means recon was skipped.
    fn warn_lead_without_scout(&self, request: &SlingRequest) {
        if request.capability != Capability::Builder {
            return;
        }
        let Some(parent) = &request.parent else {
            return;
        };
        let Ok(sessions) = SessionStore::open(&self.home.sessions_db()) else {
            return;
        };
        let parent_is_lead = sessions
            .get_by_name(parent)
            .ok()
            .flatten()
            .is_some_and(|s| s.capability == Capability::Lead);
        let has_scout = sessions
            .get_children(parent)
            .map(|children| children.iter().any(|c| c.capability == Capability::Scout))
            .unwrap_or(false);
        sessions.close();

        if parent_is_lead && !has_scout {
            eprintln!(
                "warning: lead '{parent}' is spawning builder '{}' without ever \
                 spawning a scout; consider scouting first",
                request.name
            );
        }
    }

    fn write_task_overlay(
        &self,
        worktree: &std::path::Path,
        request: &SlingRequest,
        bead_id: &str,
        branch: &str,
    ) -> Result<()> {
        let mut overlay = format!(
            "# Task binding\n\nagent: {}\ncapability: {}\nbranch: {}\n",
            request.name, request.capability, branch,
        );
        if !bead_id.is_empty() {
            overlay.push_str(&format!(
                "bead: {bead_id}\nbrief: .overstory/specs/{bead_id}.md\n"
            ));
        }
        if !request.files.is_empty() {
            overlay.push_str(&format!("edit scope: {}\n", request.files.join(", ")));
        }
        let path = worktree.join(".overstory-task.md");
        std::fs::write(&path, overlay)
            .map_err(|e| Error::Agent(format!("cannot write {}: {e}", path.display())))?;
        Ok(())
    }

    /// Base definition file for the capability; a missing file falls back
    /// to a one-line generated definition.
    fn capability_definition(&self, capability: Capability) -> Result<PathBuf> {
        let path = self
            .home
            .agent_defs_dir()
            .join(format!("{capability}.md"));
        if !path.exists() {
            std::fs::create_dir_all(self.home.agent_defs_dir())
                .map_err(|e| Error::Agent(format!("cannot create agent-defs: {e}")))?;
            std::fs::write(
                &path,
                format!("You are an overstory {capability} agent.\n"),
            )
            .map_err(|e| Error::Agent(format!("cannot write {}: {e}", path.display())))?;
        }
        Ok(path)
    }

    /// One line identifying the agent and its startup protocol.
    fn beacon_line(&self, request: &SlingRequest, bead_id: &str) -> String {
        let task = if bead_id.is_empty() {
            "no bound task".to_string()
        } else {
            format!("task {bead_id}")
        };
        format!(
            "You are {name}, an overstory {capability} agent ({task}, depth {depth}, parent {parent}). \
             Startup protocol: run `overstory mail check --inject --agent {name}`, read \
             .overstory-task.md, do the work, send worker_done mail to your parent, then exit.",
            name = request.name,
            capability = request.capability,
            depth = request.depth.unwrap_or(0),
            parent = request.parent.as_deref().unwrap_or("operator"),
        )
    }

    fn record_spawn_event(&self, session: &Session) {
        let Ok(events) = EventStore::open(&self.home.events_db()) else {
            return;
        };
        let _ = events.insert(&NewEvent {
            run_id: session.run_id.clone(),
            session_id: Some(session.id.clone()),
            data: Some(serde_json::json!({
                "capability": session.capability.as_str(),
                "bead": session.bead_id,
                "parent": session.parent_agent,
                "depth": session.depth,
                "spawned_at": now_iso(),
            })),
            ..NewEvent::new(&session.agent_name, EventType::Spawn)
        });
        events.close();
    }
}

/// Stop an agent: kill its process tree, drop the tmux session, and mark
/// the session completed. Idempotent for already-dead panes.
pub fn stop_agent(
    home: &OverstoryHome,
    tmux: &dyn TmuxClient,
    agent_name: &str,
) -> Result<Session> {
    let sessions = SessionStore::open(&home.sessions_db())?;
    let session = sessions
        .get_by_name(agent_name)?
        .ok_or_else(|| Error::validation("name", format!("no session named '{agent_name}'")))?;

    if tmux.is_session_alive(&session.tmux_session)? {
        if let Ok(Some(pid)) = tmux.pane_pid(&session.tmux_session) {
            let _ = super::process::kill_process_tree(pid);
        }
        let _ = tmux.kill_session(&session.tmux_session);
    }
    sessions.update_state(agent_name, SessionState::Completed)?;
    let stopped = sessions.get_by_name(agent_name)?.unwrap_or(session);
    sessions.close();
    Ok(stopped)
}
