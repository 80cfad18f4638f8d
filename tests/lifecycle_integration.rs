//! End-to-end lifecycle: sling an agent with a mocked tmux, kill its pane
//! out from under the control plane, and watch the reconciler catch up.

use std::process::{Command, Stdio};

use overstory::agents::sling::{Sling, SlingRequest};
use overstory::agents::tmux::{MockTmuxClient, TmuxClient};
use overstory::agents::watchdog::Watchdog;
use overstory::config::Config;
use overstory::mail::{nudge, MailBroker, SendRequest};
use overstory::paths::OverstoryHome;
use overstory::store::{
    Capability, EventFilter, EventStore, EventType, MailPriority, MailType, SessionState,
    SessionStore,
};
use tempfile::TempDir;

fn init_project() -> (TempDir, OverstoryHome, Config) {
    let temp = TempDir::new().unwrap();
    let run = |args: &[&str]| {
        let status = Command::new("git")
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

    let home = OverstoryHome::at(temp.path());
    home.ensure_layout().unwrap();
    let mut config = Config::default();
    config.project.root = Some(temp.path().to_path_buf());
    config.project.name = "demo".to_string();
    config.agents.stagger_delay_ms = 0;
    config.beads.enabled = false;
    (temp, home, config)
}

fn sling_request(name: &str) -> SlingRequest {
    SlingRequest {
        capability: Capability::Builder,
        name: name.to_string(),
        spec: None,
        files: Vec::new(),
        parent: None,
        depth: None,
        force_hierarchy: false,
        bead_id: Some("task-1".to_string()),
    }
}

#[tokio::test]
async fn external_kill_reconciles_to_zombie_with_synthetic_event() {
    let (_temp, home, config) = init_project();
    let tmux = MockTmuxClient::new();

    let session = Sling::new(&home, &config, &tmux)
        .with_uid(1000)
        .with_fast_timings()
        .sling(&sling_request("alice"))
        .await
        .unwrap();
    assert_eq!(session.state, SessionState::Booting);
    assert!(tmux.is_session_alive("overstory-demo-alice").unwrap());

    // first hook event proves liveness
    overstory::hook_events::handle_log(
        &home,
        "alice",
        r#"{"hook_event_name":"PreToolUse","tool_name":"Bash"}"#,
    )
    .unwrap();
    let sessions = SessionStore::open(&home.sessions_db()).unwrap();
    assert_eq!(
        sessions.get_by_name("alice").unwrap().unwrap().state,
        SessionState::Working
    );
    sessions.close();

    // kill -9 equivalent: pane vanishes without any session_end
    tmux.drop_session("overstory-demo-alice");

    let watchdog = Watchdog::new(&home, &config, &tmux, None);
    let report = watchdog.tick().await.unwrap();
    assert_eq!(report.zombified, vec!["alice"]);

    let sessions = SessionStore::open(&home.sessions_db()).unwrap();
    assert_eq!(
        sessions.get_by_name("alice").unwrap().unwrap().state,
        SessionState::Zombie
    );
    sessions.close();

    let events = EventStore::open(&home.events_db()).unwrap();
    let ends = events
        .query(&EventFilter {
            event_type: Some(EventType::SessionEnd),
            ..EventFilter::default()
        })
        .unwrap();
    events.close();
    assert_eq!(ends.len(), 1);
    let data: serde_json::Value = serde_json::from_str(ends[0].data.as_deref().unwrap()).unwrap();
    assert_eq!(data["reason"], "external");

    // terminal states absorb: the next tick does nothing
    let report = watchdog.tick().await.unwrap();
    assert!(report.zombified.is_empty());
}

#[tokio::test]
async fn one_live_session_per_agent() {
    let (_temp, home, config) = init_project();
    let tmux = MockTmuxClient::new();
    let sling = Sling::new(&home, &config, &tmux)
        .with_uid(1000)
        .with_fast_timings();

    sling.sling(&sling_request("alice")).await.unwrap();
    let err = sling.sling(&sling_request("alice")).await.unwrap_err();
    assert_eq!(err.kind(), "Validation");

    let sessions = SessionStore::open(&home.sessions_db()).unwrap();
    let live: Vec<_> = sessions
        .get_active()
        .unwrap()
        .into_iter()
        .filter(|s| s.agent_name == "alice")
        .collect();
    sessions.close();
    assert_eq!(live.len(), 1);
}

#[test]
fn auto_nudge_pipeline_banner_once() {
    let (_temp, home, _config) = init_project();
    let broker = MailBroker::open(&home).unwrap();

    broker
        .send(&SendRequest {
            from: "lead-1".to_string(),
            to: "builder-1".to_string(),
            subject: "deploy the fix".to_string(),
            body: "ship it".to_string(),
            mail_type: MailType::Status,
            priority: MailPriority::Urgent,
            payload: None,
        })
        .unwrap();
    assert!(nudge::has_marker(&home, "builder-1"));

    // first inject: banner then body, marker cleared
    let first = broker.check_inject("builder-1", None).unwrap().unwrap();
    assert!(first
        .contains("🚨 PRIORITY: urgent priority message from lead-1 — \"deploy the fix\""));
    assert!(first.contains("ship it"));
    assert!(!nudge::has_marker(&home, "builder-1"));

    // second send at normal priority: message only, no banner
    broker
        .send(&SendRequest {
            from: "lead-1".to_string(),
            to: "builder-1".to_string(),
            subject: "thanks".to_string(),
            body: "looks good".to_string(),
            mail_type: MailType::Status,
            priority: MailPriority::Normal,
            payload: None,
        })
        .unwrap();
    let second = broker.check_inject("builder-1", None).unwrap().unwrap();
    assert!(!second.contains("🚨"));
    assert!(second.contains("looks good"));
}

#[test]
fn broadcast_fans_out_per_recipient() {
    let (_temp, home, _config) = init_project();

    let sessions = SessionStore::open(&home.sessions_db()).unwrap();
    let now = chrono::Utc::now();
    for name in ["builder-1", "builder-2", "builder-3"] {
        sessions
            .upsert(&overstory::store::Session {
                id: format!("s-{name}"),
                agent_name: name.to_string(),
                capability: Capability::Builder,
                worktree_path: "/tmp".into(),
                branch_name: format!("overstory/{name}/t"),
                bead_id: "t".to_string(),
                tmux_session: format!("overstory-demo-{name}"),
                state: SessionState::Working,
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
    }
    sessions.close();

    let broker = MailBroker::open(&home).unwrap();
    let sent = broker
        .send(&SendRequest {
            from: "lead-1".to_string(),
            to: "@builders".to_string(),
            subject: "S".to_string(),
            body: "B".to_string(),
            mail_type: MailType::Dispatch,
            priority: MailPriority::High,
            payload: None,
        })
        .unwrap();

    assert_eq!(sent.len(), 3);
    for name in ["builder-1", "builder-2", "builder-3"] {
        assert!(nudge::has_marker(&home, name), "{name} missing marker");
        assert_eq!(broker.check(name).unwrap().len(), 1);
    }
}
