//! Hook payload ingestion (`overstory log ...`).
//!
//! Agents never write the stores directly; their hook scripts pipe the
//! CLI's JSON payloads into `overstory log`, which turns them into events,
//! liveness updates, metrics, and checkpoints.

use serde::Deserialize;

use crate::errors::{Error, Result};
use crate::paths::{self, OverstoryHome};
use crate::prime::Checkpoint;
use crate::store::{
    now_iso, to_iso, EventLevel, EventStore, EventType, MetricsStore, NewEvent, SessionMetrics,
    SessionState, SessionStore,
};

/// The subset of the agent CLI's hook payload the control plane reads.
/// Unknown fields are ignored so CLI upgrades do not break logging.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HookPayload {
    pub hook_event_name: String,
    pub session_id: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    pub tool_error: Option<String>,

    // Stop payload extras
    pub exit_code: Option<i64>,
    pub model: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
    pub cache_creation_tokens: Option<i64>,
    pub total_cost_usd: Option<f64>,

    // PreCompact payload extras
    pub progress_summary: Option<String>,
    pub files_modified: Option<Vec<String>>,
    pub pending_work: Option<Vec<String>>,
    pub current_branch: Option<String>,
}

impl HookPayload {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Error::Validation(format!("invalid hook payload: {e}")))
    }
}

/// `overstory log --stdin`: tool and lifecycle events.
pub fn handle_log(home: &OverstoryHome, agent: &str, raw: &str) -> Result<()> {
    let payload = HookPayload::parse(raw)?;
    let run_id = paths::read_pointer(&home.current_run_file());
    let events = EventStore::open(&home.events_db())?;

    match payload.hook_event_name.as_str() {
        "PreToolUse" => {
            events.insert(&NewEvent {
                run_id,
                session_id: payload.session_id.clone(),
                tool_name: payload.tool_name.clone(),
                tool_args: payload
                    .tool_input
                    .as_ref()
                    .map(serde_json::Value::to_string),
                ..NewEvent::new(agent, EventType::ToolStart)
            })?;
        }
        "PostToolUse" => {
            // close the most recent open tool_start for this (agent, tool)
            let duration = payload
                .tool_name
                .as_deref()
                .and_then(|tool| events.correlate_tool_end(agent, tool).ok().flatten());
            events.insert(&NewEvent {
                run_id,
                session_id: payload.session_id.clone(),
                tool_name: payload.tool_name.clone(),
                level: if payload.tool_error.is_some() {
                    Some(EventLevel::Error)
                } else {
                    None
                },
                data: duration.map(|(start_id, ms)| {
                    serde_json::json!({ "correlated_start": start_id, "duration_ms": ms })
                }),
                ..NewEvent::new(agent, EventType::ToolEnd)
            })?;
        }
        "SessionStart" => {
            events.insert(&NewEvent {
                run_id,
                session_id: payload.session_id.clone(),
                ..NewEvent::new(agent, EventType::SessionStart)
            })?;
        }
        other => {
            events.insert(&NewEvent {
                run_id,
                session_id: payload.session_id.clone(),
                data: Some(serde_json::json!({ "hook_event": other })),
                ..NewEvent::new(agent, EventType::Custom)
            })?;
        }
    }
    events.close();

    // every hook event proves liveness
    let sessions = SessionStore::open(&home.sessions_db())?;
    sessions.update_last_activity(agent)?;
    sessions.close();
    Ok(())
}

/// `overstory log session-end --stdin`: terminal transition plus the
/// session's metrics totals.
pub fn handle_session_end(home: &OverstoryHome, agent: &str, raw: &str) -> Result<()> {
    let payload = HookPayload::parse(raw)?;
    let run_id = paths::read_pointer(&home.current_run_file());

    let sessions = SessionStore::open(&home.sessions_db())?;
    let session = sessions.get_by_name(agent)?;

    let events = EventStore::open(&home.events_db())?;
    events.insert(&NewEvent {
        run_id: run_id.clone(),
        session_id: payload
            .session_id
            .clone()
            .or_else(|| session.as_ref().map(|s| s.id.clone())),
        data: Some(serde_json::json!({ "reason": "clean", "exit_code": payload.exit_code })),
        ..NewEvent::new(agent, EventType::SessionEnd)
    })?;
    events.close();

    if let Some(session) = &session {
        if session.state.is_active() {
            sessions.update_state(agent, SessionState::Completed)?;
        }

        // metrics are best-effort: a completed session is the primary fact
        if let Ok(metrics) = MetricsStore::open(&home.metrics_db()) {
            let now = chrono::Utc::now();
            let _ = metrics.record_session(&SessionMetrics {
                agent_name: agent.to_string(),
                bead_id: session.bead_id.clone(),
                capability: session.capability.as_str().to_string(),
                started_at: to_iso(session.started_at),
                completed_at: Some(now_iso()),
                duration_ms: (now - session.started_at).num_milliseconds(),
                exit_code: payload.exit_code,
                merge_result: None,
                parent_agent: session.parent_agent.clone(),
                input_tokens: payload.input_tokens.unwrap_or(0),
                output_tokens: payload.output_tokens.unwrap_or(0),
                cache_read_tokens: payload.cache_read_tokens.unwrap_or(0),
                cache_creation_tokens: payload.cache_creation_tokens.unwrap_or(0),
                estimated_cost_usd: payload.total_cost_usd,
                model_used: payload.model.clone(),
                run_id,
            });
        }
    }
    sessions.close();
    Ok(())
}

/// `overstory log checkpoint --stdin`: PreCompact snapshot for the next
/// compact prime.
pub fn handle_checkpoint(home: &OverstoryHome, agent: &str, raw: &str) -> Result<()> {
    let payload = HookPayload::parse(raw)?;
    let checkpoint = Checkpoint {
        progress_summary: payload.progress_summary.unwrap_or_default(),
        files_modified: payload.files_modified.unwrap_or_default(),
        pending_work: payload.pending_work.unwrap_or_default(),
        current_branch: payload.current_branch,
    };
    checkpoint.save(home, agent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Capability, EventFilter, Session};
    use chrono::Utc;
    use tempfile::TempDir;

    fn setup() -> (TempDir, OverstoryHome) {
        let temp = TempDir::new().unwrap();
        let home = OverstoryHome::at(temp.path());
        home.ensure_layout().unwrap();
        (temp, home)
    }

    fn seed_session(home: &OverstoryHome, name: &str, state: SessionState) {
        let store = SessionStore::open(&home.sessions_db()).unwrap();
        let now = Utc::now();
        store
            .upsert(&Session {
                id: format!("s-{name}"),
                agent_name: name.to_string(),
                capability: Capability::Builder,
                worktree_path: "/tmp".into(),
                branch_name: format!("overstory/{name}/bd-1"),
                bead_id: "bd-1".to_string(),
                tmux_session: format!("overstory-demo-{name}"),
                state,
                pid: None,
                parent_agent: None,
                depth: 0,
                run_id: None,
                started_at: now,
                last_activity: now,
                escalation_level: 0,
                stalled_since: None,
            })
            .unwrap();
        store.close();
    }

    #[test]
    fn test_tool_start_end_correlation_through_log() {
        let (_temp, home) = setup();
        seed_session(&home, "alice", SessionState::Working);

        handle_log(
            &home,
            "alice",
            r#"{"hook_event_name":"PreToolUse","tool_name":"Bash","tool_input":{"command":"ls"}}"#,
        )
        .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        handle_log(
            &home,
            "alice",
            r#"{"hook_event_name":"PostToolUse","tool_name":"Bash"}"#,
        )
        .unwrap();

        let events = EventStore::open(&home.events_db()).unwrap();
        let starts = events
            .query(&EventFilter {
                event_type: Some(EventType::ToolStart),
                ..EventFilter::default()
            })
            .unwrap();
        assert_eq!(starts.len(), 1);
        assert!(starts[0].tool_duration_ms.unwrap() >= 5);
        assert!(starts[0].tool_args.as_deref().unwrap().contains("ls"));

        let ends = events
            .query(&EventFilter {
                event_type: Some(EventType::ToolEnd),
                ..EventFilter::default()
            })
            .unwrap();
        assert_eq!(ends.len(), 1);
    }

    #[test]
    fn test_log_revives_booting_session() {
        let (_temp, home) = setup();
        seed_session(&home, "alice", SessionState::Booting);

        handle_log(
            &home,
            "alice",
            r#"{"hook_event_name":"PreToolUse","tool_name":"Read"}"#,
        )
        .unwrap();

        let store = SessionStore::open(&home.sessions_db()).unwrap();
        assert_eq!(
            store.get_by_name("alice").unwrap().unwrap().state,
            SessionState::Working
        );
        store.close();
    }

    #[test]
    fn test_session_end_completes_and_records_metrics() {
        let (_temp, home) = setup();
        seed_session(&home, "alice", SessionState::Working);

        handle_session_end(
            &home,
            "alice",
            r#"{"hook_event_name":"Stop","exit_code":0,"model":"sonnet",
                "input_tokens":1200,"output_tokens":300,"total_cost_usd":0.42}"#,
        )
        .unwrap();

        let store = SessionStore::open(&home.sessions_db()).unwrap();
        assert_eq!(
            store.get_by_name("alice").unwrap().unwrap().state,
            SessionState::Completed
        );
        store.close();

        let metrics = MetricsStore::open(&home.metrics_db()).unwrap();
        let rows = metrics.sessions_by_agent("alice").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].input_tokens, 1200);
        assert_eq!(rows[0].estimated_cost_usd, Some(0.42));
        assert_eq!(rows[0].model_used.as_deref(), Some("sonnet"));
    }

    #[test]
    fn test_checkpoint_saved() {
        let (_temp, home) = setup();
        handle_checkpoint(
            &home,
            "alice",
            r#"{"hook_event_name":"PreCompact","progress_summary":"halfway",
                "files_modified":["a.rs"],"pending_work":["tests"]}"#,
        )
        .unwrap();

        let checkpoint = Checkpoint::load(&home, "alice").unwrap();
        assert_eq!(checkpoint.progress_summary, "halfway");
        assert_eq!(checkpoint.files_modified, vec!["a.rs"]);
    }

    #[test]
    fn test_bad_payload_is_validation_error() {
        let (_temp, home) = setup();
        let err = handle_log(&home, "alice", "not json").unwrap_err();
        assert_eq!(err.kind(), "Validation");
    }

    #[test]
    fn test_unmatched_tool_end_recorded_without_duration() {
        let (_temp, home) = setup();
        seed_session(&home, "alice", SessionState::Working);

        handle_log(
            &home,
            "alice",
            r#"{"hook_event_name":"PostToolUse","tool_name":"Bash"}"#,
        )
        .unwrap();

        let events = EventStore::open(&home.events_db()).unwrap();
        let ends = events
            .query(&EventFilter {
                event_type: Some(EventType::ToolEnd),
                ..EventFilter::default()
            })
            .unwrap();
        assert_eq!(ends.len(), 1);
        assert!(ends[0].data.is_none());
    }
}
