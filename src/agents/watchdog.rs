//! The watchdog: periodic reconciler over live state.
//!
//! Tier 0 is mechanical: every tick it walks non-terminal sessions,
//! reconciles them against the tmux inventory, advances the stall state
//! machine, and emits synthetic lifecycle events for processes that died
//! outside the control plane. Tier 1 asks the provider to triage agents
//! that stay stalled through the nudge ladder. Tier 2 is a persistent
//! monitor agent whose lifecycle mirrors the coordinator's.
//!
//! Per-agent failures never abort a tick; the watchdog logs and moves to
//! the next session.

use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use backon::{BlockingRetryable, ConstantBuilder};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use super::process;
use super::provider::ProviderClient;
use super::tmux::TmuxClient;
use crate::config::Config;
use crate::errors::Result;
use crate::mail::nudge::{self, PendingNudge};
use crate::paths::{self, OverstoryHome};
use crate::store::{
    Capability, EventFilter, EventLevel, EventStore, EventType, NewEvent, Session, SessionState,
    SessionStore,
};

/// Marker delivery retries.
const NUDGE_ATTEMPTS: usize = 3;
const NUDGE_SPACING: Duration = Duration::from_millis(500);

/// Escalation level at which tier 1 triage kicks in.
const TRIAGE_THRESHOLD: u32 = 3;

/// Event lines included in the triage prompt.
const TRIAGE_CONTEXT_EVENTS: usize = 20;

/// Why a synthetic `session_end` was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    Clean,
    External,
    StallKill,
}

impl EndReason {
    fn as_str(self) -> &'static str {
        match self {
            EndReason::Clean => "clean",
            EndReason::External => "external",
            EndReason::StallKill => "stall_kill",
        }
    }
}

/// Provider verdict for a stalled agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageDecision {
    Retry,
    Terminate,
    Extend,
}

/// Keyword match, case-insensitive, first keyword in this order wins.
pub fn parse_triage(response: &str) -> TriageDecision {
    let lower = response.to_lowercase();
    const KEYWORDS: [(&str, TriageDecision); 5] = [
        ("retry", TriageDecision::Retry),
        ("recoverable", TriageDecision::Retry),
        ("terminate", TriageDecision::Terminate),
        ("fatal", TriageDecision::Terminate),
        ("failed", TriageDecision::Terminate),
    ];
    for (keyword, decision) in KEYWORDS {
        if lower.contains(keyword) {
            return decision;
        }
    }
    TriageDecision::Extend
}

/// What one reconciliation tick did.
#[derive(Debug, Default, Serialize)]
pub struct TickReport {
    pub checked: usize,
    pub zombified: Vec<String>,
    pub stalled: Vec<String>,
    pub killed: Vec<String>,
    pub nudged: Vec<String>,
    pub triaged: Vec<String>,
    pub run_completed: Option<String>,
}

impl TickReport {
    pub fn is_quiet(&self) -> bool {
        self.zombified.is_empty()
            && self.stalled.is_empty()
            && self.killed.is_empty()
            && self.nudged.is_empty()
            && self.triaged.is_empty()
            && self.run_completed.is_none()
    }
}

pub struct Watchdog<'a> {
    home: &'a OverstoryHome,
    config: &'a Config,
    tmux: &'a dyn TmuxClient,
    provider: Option<&'a dyn ProviderClient>,
}

impl<'a> Watchdog<'a> {
    pub fn new(
        home: &'a OverstoryHome,
        config: &'a Config,
        tmux: &'a dyn TmuxClient,
        provider: Option<&'a dyn ProviderClient>,
    ) -> Self {
        Self {
            home,
            config,
            tmux,
            provider,
        }
    }

    /// One Tier 0 reconciliation pass.
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();
        let sessions = SessionStore::open(&self.home.sessions_db())?;
        let active = sessions.get_active()?;
        report.checked = active.len();

        let mut nudge_state = self.load_nudge_state();
        let now_ms = Utc::now().timestamp_millis();

        for session in active {
            if let Err(e) = self
                .reconcile_session(&sessions, &session, &mut nudge_state, now_ms, &mut report)
                .await
            {
                warn!(agent = %session.agent_name, error = %e, "reconciliation failed for agent");
            }
        }

        self.save_nudge_state(&nudge_state);
        report.run_completed = self.complete_finished_run(&sessions)?;
        sessions.close();
        Ok(report)
    }

    async fn reconcile_session(
        &self,
        sessions: &SessionStore,
        session: &Session,
        nudge_state: &mut HashMap<String, i64>,
        now_ms: i64,
        report: &mut TickReport,
    ) -> Result<()> {
        let tmux_alive = self.tmux.is_session_alive(&session.tmux_session)?;

        // pane gone: the session is a zombie no matter what state claims
        if !tmux_alive {
            let reason = if session.state == SessionState::Stalled {
                EndReason::StallKill
            } else if self.saw_session_end(&session.agent_name) {
                EndReason::Clean
            } else {
                EndReason::External
            };
            sessions.update_state(&session.agent_name, SessionState::Zombie)?;
            self.emit_session_end(session, reason);
            info!(agent = %session.agent_name, reason = reason.as_str(), "pane gone, session is a zombie");
            report.zombified.push(session.agent_name.clone());
            return Ok(());
        }

        let idle_ms = (Utc::now() - session.last_activity).num_milliseconds();

        match session.state {
            // booting agents have not proven liveness yet; they only leave
            // booting via their first hook event or a dead pane
            SessionState::Booting => {}
            SessionState::Working => {
                if idle_ms > self.config.watchdog.stale_threshold_ms as i64 {
                    sessions.update_state(&session.agent_name, SessionState::Stalled)?;
                    info!(agent = %session.agent_name, idle_ms, "agent stalled");
                    report.stalled.push(session.agent_name.clone());
                }
            }
            SessionState::Stalled => {
                let stalled_ms = session
                    .stalled_since
                    .map(|since| (Utc::now() - since).num_milliseconds())
                    .unwrap_or(idle_ms);

                if stalled_ms > self.config.watchdog.zombie_threshold_ms as i64 {
                    if let Some(pid) = session.pid {
                        let _ = process::kill_process_tree(pid as i32);
                    }
                    let _ = self.tmux.kill_session(&session.tmux_session);
                    sessions.update_state(&session.agent_name, SessionState::Zombie)?;
                    self.emit_session_end(session, EndReason::StallKill);
                    info!(agent = %session.agent_name, stalled_ms, "stall exceeded zombie threshold, killed");
                    report.killed.push(session.agent_name.clone());
                    return Ok(());
                }

                if self.config.watchdog.tier1_enabled
                    && session.escalation_level >= TRIAGE_THRESHOLD
                {
                    self.triage(sessions, session, report).await?;
                    return Ok(());
                }

                let last_nudge = nudge_state
                    .get(&session.agent_name)
                    .copied()
                    .unwrap_or(i64::MIN);
                if now_ms - last_nudge >= self.config.watchdog.nudge_interval_ms as i64 {
                    self.send_nudge(session)?;
                    sessions
                        .update_escalation(&session.agent_name, session.escalation_level + 1)?;
                    nudge_state.insert(session.agent_name.clone(), now_ms);
                    report.nudged.push(session.agent_name.clone());
                }
            }
            SessionState::Completed | SessionState::Zombie => {}
        }
        Ok(())
    }

    /// Progressive nudge ladder. Every nudge is a marker write (never
    /// direct key input), retried a few times against transient fs errors.
    fn send_nudge(&self, session: &Session) -> Result<()> {
        let message = nudge_message(session.escalation_level, session.capability);
        let marker = PendingNudge::new("watchdog", "escalation", &message, None);

        let write = || nudge::write_marker(self.home, &session.agent_name, &marker);
        write
            .retry(
                ConstantBuilder::default()
                    .with_delay(NUDGE_SPACING)
                    .with_max_times(NUDGE_ATTEMPTS),
            )
            .call()?;

        info!(
            agent = %session.agent_name,
            level = session.escalation_level,
            "nudge marker written"
        );
        Ok(())
    }

    /// Tier 1: ask the provider what to do with a chronically stalled
    /// agent. Any parse or invocation failure defaults to `extend`.
    async fn triage(
        &self,
        sessions: &SessionStore,
        session: &Session,
        report: &mut TickReport,
    ) -> Result<()> {
        let decision = match self.provider {
            Some(provider) => {
                let prompt = self.triage_prompt(session);
                match provider.complete(&prompt).await {
                    Ok(response) => parse_triage(&response),
                    Err(e) => {
                        warn!(agent = %session.agent_name, error = %e, "triage call failed, extending");
                        TriageDecision::Extend
                    }
                }
            }
            None => TriageDecision::Extend,
        };

        info!(agent = %session.agent_name, ?decision, "triage decision");
        report.triaged.push(session.agent_name.clone());

        match decision {
            TriageDecision::Retry => {
                self.send_nudge(session)?;
                sessions.update_escalation(&session.agent_name, session.escalation_level + 1)?;
            }
            TriageDecision::Terminate => {
                if let Some(pid) = session.pid {
                    let _ = process::kill_process_tree(pid as i32);
                }
                let _ = self.tmux.kill_session(&session.tmux_session);
                sessions.update_state(&session.agent_name, SessionState::Zombie)?;
                self.emit_session_end(session, EndReason::StallKill);
            }
            TriageDecision::Extend => {
                // reset the stall clock without reviving the agent
                sessions.update_state(&session.agent_name, SessionState::Stalled)?;
            }
        }
        Ok(())
    }

    fn triage_prompt(&self, session: &Session) -> String {
        let mut prompt = format!(
            "Agent '{}' ({}) has been stalled since {} with escalation level {}.\n\
             Last activity: {}. Task: {}.\n\
             Decide: reply 'retry' if the agent looks recoverable, 'terminate' if it is \
             fatally stuck, or 'extend' to give it more time.\n\nRecent events:\n",
            session.agent_name,
            session.capability,
            session
                .stalled_since
                .map_or_else(|| "unknown".to_string(), |t| t.to_rfc3339()),
            session.escalation_level,
            session.last_activity.to_rfc3339(),
            if session.bead_id.is_empty() {
                "(none)"
            } else {
                &session.bead_id
            },
        );
        if let Ok(events) = EventStore::open(&self.home.events_db()) {
            if let Ok(recent) =
                events.recent_for_agent(&session.agent_name, TRIAGE_CONTEXT_EVENTS)
            {
                for event in recent {
                    prompt.push_str(&format!(
                        "- {} {} {}\n",
                        event.created_at,
                        event.event_type,
                        event.tool_name.as_deref().unwrap_or(""),
                    ));
                }
            }
            events.close();
        }
        prompt
    }

    fn saw_session_end(&self, agent: &str) -> bool {
        let Ok(events) = EventStore::open(&self.home.events_db()) else {
            return false;
        };
        let seen = events
            .query(&EventFilter {
                agent_name: Some(agent.to_string()),
                event_type: Some(EventType::SessionEnd),
                limit: Some(1),
                ..EventFilter::default()
            })
            .map(|rows| !rows.is_empty())
            .unwrap_or(false);
        events.close();
        seen
    }

    /// Synthetic lifecycle event; best-effort.
    fn emit_session_end(&self, session: &Session, reason: EndReason) {
        let Ok(events) = EventStore::open(&self.home.events_db()) else {
            return;
        };
        let _ = events.insert(&NewEvent {
            run_id: session.run_id.clone(),
            session_id: Some(session.id.clone()),
            level: Some(EventLevel::Warn),
            data: Some(serde_json::json!({ "reason": reason.as_str(), "synthetic": true })),
            ..NewEvent::new(&session.agent_name, EventType::SessionEnd)
        });
        events.close();
    }

    /// When every session of the current run is terminal, complete the run
    /// and clear the pointer.
    fn complete_finished_run(&self, sessions: &SessionStore) -> Result<Option<String>> {
        let Some(run_id) = paths::read_pointer(&self.home.current_run_file()) else {
            return Ok(None);
        };
        let members = sessions.get_by_run(&run_id)?;
        if members.is_empty() || members.iter().any(|s| s.state.is_active()) {
            return Ok(None);
        }
        sessions.complete_run(&run_id)?;
        paths::clear_pointer(&self.home.current_run_file())?;
        info!(run = %run_id, "run completed");
        Ok(Some(run_id))
    }

    fn load_nudge_state(&self) -> HashMap<String, i64> {
        fs::read_to_string(self.home.nudge_state_file())
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn save_nudge_state(&self, state: &HashMap<String, i64>) {
        if let Ok(body) = serde_json::to_string(state) {
            let _ = fs::write(self.home.nudge_state_file(), body);
        }
    }
}

/// Progressive nudge ladder: gentle reminder, explicit next action, then a
/// capability-specific completion prompt for every level after that.
pub fn nudge_message(level: u32, capability: Capability) -> String {
    match level {
        0 => "Still with us? Check your mail and continue your task.".to_string(),
        1 => "You appear stalled. Run `overstory mail check --inject` and either \
              continue the task or report what is blocking you."
            .to_string(),
        _ => match capability {
            Capability::Builder => {
                "Wrap up now: commit what you have, send worker_done mail to your \
                 parent, and exit."
                    .to_string()
            }
            Capability::Reviewer => {
                "Wrap up now: send your review verdict as result mail and exit.".to_string()
            }
            Capability::Scout => {
                "Wrap up now: send your findings as result mail and exit.".to_string()
            }
            Capability::Merger => {
                "Wrap up now: send merge_ready for finished branches and exit.".to_string()
            }
            _ => "Wrap up now: report status to your parent and exit.".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::tmux::MockTmuxClient;
    use chrono::Duration as ChronoDuration;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn setup() -> (TempDir, OverstoryHome, Config) {
        let temp = TempDir::new().unwrap();
        let home = OverstoryHome::at(temp.path());
        home.ensure_layout().unwrap();
        let mut config = Config::default();
        config.project.name = "demo".to_string();
        (temp, home, config)
    }

    fn seed(
        home: &OverstoryHome,
        name: &str,
        state: SessionState,
        idle: ChronoDuration,
        escalation: u32,
    ) -> Session {
        let store = SessionStore::open(&home.sessions_db()).unwrap();
        let now = Utc::now();
        let session = Session {
            id: format!("s-{name}"),
            agent_name: name.to_string(),
            capability: Capability::Builder,
            worktree_path: PathBuf::from("/tmp"),
            branch_name: format!("overstory/{name}/bd-1"),
            bead_id: "bd-1".to_string(),
            tmux_session: format!("overstory-demo-{name}"),
            state,
            pid: None,
            parent_agent: None,
            depth: 0,
            run_id: None,
            started_at: now - idle,
            last_activity: now - idle,
            escalation_level: escalation,
            stalled_since: if state == SessionState::Stalled {
                Some(now - idle)
            } else {
                None
            },
        };
        store.upsert(&session).unwrap();
        store.close();
        session
    }

    #[tokio::test]
    async fn test_dead_pane_becomes_zombie_with_external_reason() {
        let (_temp, home, config) = setup();
        seed(&home, "alice", SessionState::Working, ChronoDuration::zero(), 0);
        let tmux = MockTmuxClient::new(); // pane never created → not alive

        let watchdog = Watchdog::new(&home, &config, &tmux, None);
        let report = watchdog.tick().await.unwrap();
        assert_eq!(report.zombified, vec!["alice"]);

        let store = SessionStore::open(&home.sessions_db()).unwrap();
        assert_eq!(
            store.get_by_name("alice").unwrap().unwrap().state,
            SessionState::Zombie
        );
        store.close();

        let events = EventStore::open(&home.events_db()).unwrap();
        let ends = events
            .query(&EventFilter {
                event_type: Some(EventType::SessionEnd),
                ..EventFilter::default()
            })
            .unwrap();
        assert_eq!(ends.len(), 1);
        let data: serde_json::Value = serde_json::from_str(ends[0].data.as_deref().unwrap()).unwrap();
        assert_eq!(data["reason"], "external");
    }

    #[tokio::test]
    async fn test_live_fresh_session_untouched() {
        let (_temp, home, config) = setup();
        seed(&home, "alice", SessionState::Working, ChronoDuration::zero(), 0);
        let tmux = MockTmuxClient::new();
        tmux.add_session("overstory-demo-alice", "/tmp");

        let watchdog = Watchdog::new(&home, &config, &tmux, None);
        let report = watchdog.tick().await.unwrap();
        assert!(report.is_quiet(), "{report:?}");
    }

    #[tokio::test]
    async fn test_stale_working_session_stalls() {
        let (_temp, home, config) = setup();
        seed(
            &home,
            "alice",
            SessionState::Working,
            ChronoDuration::milliseconds(config.watchdog.stale_threshold_ms as i64 + 1000),
            0,
        );
        let tmux = MockTmuxClient::new();
        tmux.add_session("overstory-demo-alice", "/tmp");

        let watchdog = Watchdog::new(&home, &config, &tmux, None);
        let report = watchdog.tick().await.unwrap();
        assert_eq!(report.stalled, vec!["alice"]);

        let store = SessionStore::open(&home.sessions_db()).unwrap();
        let session = store.get_by_name("alice").unwrap().unwrap();
        assert_eq!(session.state, SessionState::Stalled);
        assert!(session.stalled_since.is_some());
        store.close();
    }

    #[tokio::test]
    async fn test_stalled_session_gets_progressive_nudges() {
        let (_temp, home, config) = setup();
        seed(
            &home,
            "alice",
            SessionState::Stalled,
            ChronoDuration::milliseconds(1000),
            0,
        );
        let tmux = MockTmuxClient::new();
        tmux.add_session("overstory-demo-alice", "/tmp");

        let watchdog = Watchdog::new(&home, &config, &tmux, None);
        let report = watchdog.tick().await.unwrap();
        assert_eq!(report.nudged, vec!["alice"]);
        assert!(nudge::has_marker(&home, "alice"));

        let store = SessionStore::open(&home.sessions_db()).unwrap();
        assert_eq!(
            store.get_by_name("alice").unwrap().unwrap().escalation_level,
            1
        );
        store.close();

        // a second tick inside the nudge interval stays quiet
        let report = watchdog.tick().await.unwrap();
        assert!(report.nudged.is_empty());
    }

    #[tokio::test]
    async fn test_stall_past_zombie_threshold_kills() {
        let (_temp, home, config) = setup();
        seed(
            &home,
            "alice",
            SessionState::Stalled,
            ChronoDuration::milliseconds(config.watchdog.zombie_threshold_ms as i64 + 1000),
            2,
        );
        let tmux = MockTmuxClient::new();
        tmux.add_session("overstory-demo-alice", "/tmp");

        let watchdog = Watchdog::new(&home, &config, &tmux, None);
        let report = watchdog.tick().await.unwrap();
        assert_eq!(report.killed, vec!["alice"]);
        assert!(!tmux.is_session_alive("overstory-demo-alice").unwrap());

        let events = EventStore::open(&home.events_db()).unwrap();
        let ends = events
            .query(&EventFilter {
                event_type: Some(EventType::SessionEnd),
                ..EventFilter::default()
            })
            .unwrap();
        let data: serde_json::Value = serde_json::from_str(ends[0].data.as_deref().unwrap()).unwrap();
        assert_eq!(data["reason"], "stall_kill");
    }

    #[tokio::test]
    async fn test_triage_terminate() {
        let (_temp, home, mut config) = setup();
        config.watchdog.tier1_enabled = true;
        seed(
            &home,
            "alice",
            SessionState::Stalled,
            ChronoDuration::milliseconds(1000),
            TRIAGE_THRESHOLD,
        );
        let tmux = MockTmuxClient::new();
        tmux.add_session("overstory-demo-alice", "/tmp");
        let provider =
            crate::agents::provider::MockProvider::always("This looks fatal, terminate it.");

        let watchdog = Watchdog::new(&home, &config, &tmux, Some(&provider));
        let report = watchdog.tick().await.unwrap();
        assert_eq!(report.triaged, vec!["alice"]);

        let store = SessionStore::open(&home.sessions_db()).unwrap();
        assert_eq!(
            store.get_by_name("alice").unwrap().unwrap().state,
            SessionState::Zombie
        );
        store.close();
    }

    #[tokio::test]
    async fn test_triage_failure_defaults_to_extend() {
        let (_temp, home, mut config) = setup();
        config.watchdog.tier1_enabled = true;
        seed(
            &home,
            "alice",
            SessionState::Stalled,
            ChronoDuration::milliseconds(1000),
            TRIAGE_THRESHOLD,
        );
        let tmux = MockTmuxClient::new();
        tmux.add_session("overstory-demo-alice", "/tmp");
        let provider = crate::agents::provider::MockProvider::with_responses(vec![Err(
            crate::errors::Error::Agent("provider down".to_string()),
        )]);

        let watchdog = Watchdog::new(&home, &config, &tmux, Some(&provider));
        watchdog.tick().await.unwrap();

        // extended: still stalled, stall clock reset, pane alive
        let store = SessionStore::open(&home.sessions_db()).unwrap();
        let session = store.get_by_name("alice").unwrap().unwrap();
        assert_eq!(session.state, SessionState::Stalled);
        store.close();
        assert!(tmux.is_session_alive("overstory-demo-alice").unwrap());
    }

    #[tokio::test]
    async fn test_run_completion_clears_pointer() {
        let (_temp, home, config) = setup();
        let store = SessionStore::open(&home.sessions_db()).unwrap();
        store.create_run("run-1", "objective").unwrap();
        store.close();
        paths::write_pointer(&home.current_run_file(), "run-1").unwrap();

        let mut session = seed(
            &home,
            "alice",
            SessionState::Completed,
            ChronoDuration::zero(),
            0,
        );
        session.run_id = Some("run-1".to_string());
        let store = SessionStore::open(&home.sessions_db()).unwrap();
        store.upsert(&session).unwrap();
        store.close();

        let tmux = MockTmuxClient::new();
        let watchdog = Watchdog::new(&home, &config, &tmux, None);
        let report = watchdog.tick().await.unwrap();
        assert_eq!(report.run_completed.as_deref(), Some("run-1"));
        assert!(paths::read_pointer(&home.current_run_file()).is_none());

        let store = SessionStore::open(&home.sessions_db()).unwrap();
        assert!(store.get_run("run-1").unwrap().unwrap().completed_at.is_some());
        store.close();
    }

    #[tokio::test]
    async fn test_run_with_live_members_stays_open() {
        let (_temp, home, config) = setup();
        let store = SessionStore::open(&home.sessions_db()).unwrap();
        store.create_run("run-1", "objective").unwrap();
        store.close();
        paths::write_pointer(&home.current_run_file(), "run-1").unwrap();

        let mut session = seed(&home, "alice", SessionState::Working, ChronoDuration::zero(), 0);
        session.run_id = Some("run-1".to_string());
        let store = SessionStore::open(&home.sessions_db()).unwrap();
        store.upsert(&session).unwrap();
        store.close();

        let tmux = MockTmuxClient::new();
        tmux.add_session("overstory-demo-alice", "/tmp");
        let watchdog = Watchdog::new(&home, &config, &tmux, None);
        let report = watchdog.tick().await.unwrap();
        assert!(report.run_completed.is_none());
        assert!(paths::read_pointer(&home.current_run_file()).is_some());
    }

    #[test]
    fn test_parse_triage_keyword_order() {
        assert_eq!(parse_triage("RETRY the agent"), TriageDecision::Retry);
        assert_eq!(parse_triage("looks recoverable"), TriageDecision::Retry);
        assert_eq!(parse_triage("terminate immediately"), TriageDecision::Terminate);
        assert_eq!(parse_triage("this is Fatal"), TriageDecision::Terminate);
        assert_eq!(parse_triage("the task failed"), TriageDecision::Terminate);
        assert_eq!(parse_triage("give it more time"), TriageDecision::Extend);
        assert_eq!(parse_triage(""), TriageDecision::Extend);
        // keyword order wins over position: retry beats terminate
        assert_eq!(
            parse_triage("terminate? no: retry"),
            TriageDecision::Retry
        );
    }

    #[test]
    fn test_nudge_ladder_escalates() {
        let gentle = nudge_message(0, Capability::Builder);
        let explicit = nudge_message(1, Capability::Builder);
        let wrap_up = nudge_message(2, Capability::Builder);
        assert!(gentle.contains("Still with us"));
        assert!(explicit.contains("overstory mail check"));
        assert!(wrap_up.contains("worker_done"));

        let reviewer = nudge_message(5, Capability::Reviewer);
        assert!(reviewer.contains("review verdict"));
    }

    #[tokio::test]
    async fn test_booting_session_with_dead_pane_is_external() {
        let (_temp, home, config) = setup();
        seed(&home, "alice", SessionState::Booting, ChronoDuration::zero(), 0);
        let tmux = MockTmuxClient::new();

        let watchdog = Watchdog::new(&home, &config, &tmux, None);
        let report = watchdog.tick().await.unwrap();
        assert_eq!(report.zombified, vec!["alice"]);
    }

}
