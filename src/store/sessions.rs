//! Session and run persistence.
//!
//! One row per agent lifetime, keyed by `agent_name` (unique). Terminal
//! states (`completed`, `zombie`) are absorbing; the watchdog and hook
//! handlers mutate state, the scheduler inserts.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{checkpoint, now_iso, open_database, parse_iso, store_err, to_iso};
use crate::errors::{Error, Result};

/// Agent role; determines hooks, tool allow-lists, and base definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Scout,
    Builder,
    Reviewer,
    Lead,
    Merger,
    Supervisor,
    Coordinator,
    Monitor,
}

impl Capability {
    pub const ALL: [Capability; 8] = [
        Capability::Scout,
        Capability::Builder,
        Capability::Reviewer,
        Capability::Lead,
        Capability::Merger,
        Capability::Supervisor,
        Capability::Coordinator,
        Capability::Monitor,
    ];

    /// Read-only capabilities may not run file-mutating tools.
    pub fn read_only(self) -> bool {
        matches!(
            self,
            Capability::Scout | Capability::Reviewer | Capability::Monitor
        )
    }

    /// Supervisors and coordinators work directly on the canonical branch.
    pub fn uses_canonical_branch(self) -> bool {
        matches!(self, Capability::Supervisor | Capability::Coordinator)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Scout => "scout",
            Capability::Builder => "builder",
            Capability::Reviewer => "reviewer",
            Capability::Lead => "lead",
            Capability::Merger => "merger",
            Capability::Supervisor => "supervisor",
            Capability::Coordinator => "coordinator",
            Capability::Monitor => "monitor",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scout" => Ok(Capability::Scout),
            "builder" => Ok(Capability::Builder),
            "reviewer" => Ok(Capability::Reviewer),
            "lead" => Ok(Capability::Lead),
            "merger" => Ok(Capability::Merger),
            "supervisor" => Ok(Capability::Supervisor),
            "coordinator" => Ok(Capability::Coordinator),
            "monitor" => Ok(Capability::Monitor),
            other => Err(Error::validation(
                "capability",
                format!("unknown capability '{other}'"),
            )),
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Booting,
    Working,
    Stalled,
    Completed,
    Zombie,
}

impl SessionState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Zombie)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Booting => "booting",
            SessionState::Working => "working",
            SessionState::Stalled => "stalled",
            SessionState::Completed => "completed",
            SessionState::Zombie => "zombie",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "booting" => Ok(SessionState::Booting),
            "working" => Ok(SessionState::Working),
            "stalled" => Ok(SessionState::Stalled),
            "completed" => Ok(SessionState::Completed),
            "zombie" => Ok(SessionState::Zombie),
            other => Err(Error::Store(format!("unknown session state '{other}'"))),
        }
    }
}

/// One live or historical agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_name: String,
    pub capability: Capability,
    pub worktree_path: PathBuf,
    pub branch_name: String,
    pub bead_id: String,
    pub tmux_session: String,
    pub state: SessionState,
    pub pid: Option<i64>,
    pub parent_agent: Option<String>,
    pub depth: u32,
    pub run_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub escalation_level: u32,
    pub stalled_since: Option<DateTime<Utc>>,
}

/// A grouping of sessions under one operator objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub objective: String,
}

/// Legacy JSON session record, imported once when the SQL file is first
/// created. Pre-`run_id` records normalize missing fields to defaults.
#[derive(Debug, Deserialize)]
struct LegacySession {
    id: String,
    agent_name: String,
    capability: Capability,
    worktree_path: PathBuf,
    branch_name: String,
    #[serde(default)]
    bead_id: String,
    tmux_session: String,
    state: SessionState,
    #[serde(default)]
    pid: Option<i64>,
    #[serde(default)]
    parent_agent: Option<String>,
    #[serde(default)]
    depth: u32,
    #[serde(default)]
    run_id: Option<String>,
    started_at: DateTime<Utc>,
    #[serde(default)]
    last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    escalation_level: u32,
}

pub struct SessionStore {
    conn: Connection,
}

impl SessionStore {
    /// Open (and create if necessary) `sessions.db`.
    ///
    /// If the SQL file does not yet exist but a legacy `sessions.json`
    /// sits next to it, its entries are imported before returning.
    pub fn open(db_path: &Path) -> Result<Self> {
        let fresh = !db_path.exists();
        let conn = open_database(db_path)?;
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        let store = Self { conn };

        if fresh {
            let legacy = db_path.with_file_name("sessions.json");
            if legacy.exists() {
                store.import_legacy(&legacy)?;
            }
        }
        Ok(store)
    }

    /// Checkpoint and close. Dropping without calling this also
    /// checkpoints, best-effort.
    pub fn close(self) {
        checkpoint(&self.conn);
    }

    fn import_legacy(&self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Store(format!("cannot read {}: {e}", path.display())))?;
        let entries: Vec<LegacySession> = serde_json::from_str(&raw)
            .map_err(|e| Error::Store(format!("cannot parse {}: {e}", path.display())))?;

        for legacy in entries {
            let session = Session {
                last_activity: legacy.last_activity.unwrap_or(legacy.started_at),
                id: legacy.id,
                agent_name: legacy.agent_name,
                capability: legacy.capability,
                worktree_path: legacy.worktree_path,
                branch_name: legacy.branch_name,
                bead_id: legacy.bead_id,
                tmux_session: legacy.tmux_session,
                state: legacy.state,
                pid: legacy.pid,
                parent_agent: legacy.parent_agent,
                depth: legacy.depth,
                run_id: legacy.run_id,
                started_at: legacy.started_at,
                escalation_level: legacy.escalation_level,
                stalled_since: None,
            };
            self.upsert(&session)?;
        }
        tracing::info!(path = %path.display(), "imported legacy session file");
        Ok(())
    }

    pub fn upsert(&self, session: &Session) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sessions (
                     id, agent_name, capability, worktree_path, branch_name,
                     bead_id, tmux_session, state, pid, parent_agent, depth,
                     run_id, started_at, last_activity, escalation_level,
                     stalled_since
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(agent_name) DO UPDATE SET
                     id = excluded.id,
                     capability = excluded.capability,
                     worktree_path = excluded.worktree_path,
                     branch_name = excluded.branch_name,
                     bead_id = excluded.bead_id,
                     tmux_session = excluded.tmux_session,
                     state = excluded.state,
                     pid = excluded.pid,
                     parent_agent = excluded.parent_agent,
                     depth = excluded.depth,
                     run_id = excluded.run_id,
                     started_at = excluded.started_at,
                     last_activity = excluded.last_activity,
                     escalation_level = excluded.escalation_level,
                     stalled_since = excluded.stalled_since",
                params![
                    session.id,
                    session.agent_name,
                    session.capability.as_str(),
                    session.worktree_path.to_string_lossy(),
                    session.branch_name,
                    session.bead_id,
                    session.tmux_session,
                    session.state.as_str(),
                    session.pid,
                    session.parent_agent,
                    session.depth,
                    session.run_id,
                    to_iso(session.started_at),
                    to_iso(session.last_activity),
                    session.escalation_level,
                    session.stalled_since.map(to_iso),
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    pub fn get_by_name(&self, agent_name: &str) -> Result<Option<Session>> {
        self.conn
            .query_row(
                &format!("{SELECT_SESSION} WHERE agent_name = ?1"),
                params![agent_name],
                row_to_session,
            )
            .optional()
            .map_err(store_err)
    }

    pub fn get_all(&self) -> Result<Vec<Session>> {
        self.query_sessions(&format!("{SELECT_SESSION} ORDER BY started_at"), &[])
    }

    /// Sessions in a non-terminal state.
    pub fn get_active(&self) -> Result<Vec<Session>> {
        self.query_sessions(
            &format!(
                "{SELECT_SESSION} WHERE state IN ('booting','working','stalled') ORDER BY started_at"
            ),
            &[],
        )
    }

    pub fn get_by_run(&self, run_id: &str) -> Result<Vec<Session>> {
        self.query_sessions(
            &format!("{SELECT_SESSION} WHERE run_id = ?1 ORDER BY started_at"),
            &[&run_id],
        )
    }

    pub fn get_children(&self, parent_agent: &str) -> Result<Vec<Session>> {
        self.query_sessions(
            &format!("{SELECT_SESSION} WHERE parent_agent = ?1 ORDER BY started_at"),
            &[&parent_agent],
        )
    }

    fn query_sessions(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<Session>> {
        let mut stmt = self.conn.prepare(sql).map_err(store_err)?;
        let rows = stmt
            .query_map(params, row_to_session)
            .map_err(store_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)?;
        Ok(rows)
    }

    pub fn update_state(&self, agent_name: &str, state: SessionState) -> Result<()> {
        let stalled_since = if state == SessionState::Stalled {
            Some(now_iso())
        } else {
            None
        };
        self.conn
            .execute(
                "UPDATE sessions SET state = ?2, stalled_since = ?3 WHERE agent_name = ?1",
                params![agent_name, state.as_str(), stalled_since],
            )
            .map_err(store_err)?;
        Ok(())
    }

    /// Record liveness. A hook event from a `zombie` or `booting` agent
    /// proves the process is alive, so those states revert to `working`.
    pub fn update_last_activity(&self, agent_name: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sessions SET
                     last_activity = ?2,
                     stalled_since = NULL,
                     state = CASE WHEN state IN ('zombie','booting','stalled')
                                  THEN 'working' ELSE state END
                 WHERE agent_name = ?1",
                params![agent_name, now_iso()],
            )
            .map_err(store_err)?;
        Ok(())
    }

    pub fn update_escalation(&self, agent_name: &str, level: u32) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sessions SET escalation_level = ?2 WHERE agent_name = ?1",
                params![agent_name, level],
            )
            .map_err(store_err)?;
        Ok(())
    }

    pub fn delete(&self, agent_name: &str) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "DELETE FROM sessions WHERE agent_name = ?1",
                params![agent_name],
            )
            .map_err(store_err)?;
        Ok(n > 0)
    }

    // ─── Runs ───────────────────────────────────────────────────────────

    pub fn create_run(&self, id: &str, objective: &str) -> Result<Run> {
        let started_at = now_iso();
        self.conn
            .execute(
                "INSERT INTO runs (id, started_at, completed_at, objective)
                 VALUES (?1, ?2, NULL, ?3)",
                params![id, started_at, objective],
            )
            .map_err(store_err)?;
        Ok(Run {
            id: id.to_string(),
            started_at: parse_iso(&started_at)?,
            completed_at: None,
            objective: objective.to_string(),
        })
    }

    pub fn get_run(&self, id: &str) -> Result<Option<Run>> {
        self.conn
            .query_row(
                "SELECT id, started_at, completed_at, objective FROM runs WHERE id = ?1",
                params![id],
                row_to_run,
            )
            .optional()
            .map_err(store_err)
    }

    pub fn complete_run(&self, id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET completed_at = ?2 WHERE id = ?1 AND completed_at IS NULL",
                params![id, now_iso()],
            )
            .map_err(store_err)?;
        Ok(())
    }

    pub fn list_runs(&self) -> Result<Vec<Run>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, started_at, completed_at, objective FROM runs ORDER BY started_at DESC",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], row_to_run)
            .map_err(store_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)?;
        Ok(rows)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id               TEXT NOT NULL,
    agent_name       TEXT PRIMARY KEY,
    capability       TEXT NOT NULL,
    worktree_path    TEXT NOT NULL,
    branch_name      TEXT NOT NULL,
    bead_id          TEXT NOT NULL DEFAULT '',
    tmux_session     TEXT NOT NULL,
    state            TEXT NOT NULL,
    pid              INTEGER,
    parent_agent     TEXT,
    depth            INTEGER NOT NULL DEFAULT 0,
    run_id           TEXT,
    started_at       TEXT NOT NULL,
    last_activity    TEXT NOT NULL,
    escalation_level INTEGER NOT NULL DEFAULT 0,
    stalled_since    TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_state ON sessions(state);
CREATE INDEX IF NOT EXISTS idx_sessions_run ON sessions(run_id);

CREATE TABLE IF NOT EXISTS runs (
    id           TEXT PRIMARY KEY,
    started_at   TEXT NOT NULL,
    completed_at TEXT,
    objective    TEXT NOT NULL DEFAULT ''
);
";

const SELECT_SESSION: &str = "SELECT id, agent_name, capability, worktree_path, branch_name, \
     bead_id, tmux_session, state, pid, parent_agent, depth, run_id, \
     started_at, last_activity, escalation_level, stalled_since FROM sessions";

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let capability: String = row.get(2)?;
    let state: String = row.get(7)?;
    let worktree: String = row.get(3)?;
    let started_at: String = row.get(12)?;
    let last_activity: String = row.get(13)?;
    let stalled_since: Option<String> = row.get(15)?;

    Ok(Session {
        id: row.get(0)?,
        agent_name: row.get(1)?,
        capability: capability.parse().map_err(bad_column)?,
        worktree_path: PathBuf::from(worktree),
        branch_name: row.get(4)?,
        bead_id: row.get(5)?,
        tmux_session: row.get(6)?,
        state: state.parse().map_err(bad_column)?,
        pid: row.get(8)?,
        parent_agent: row.get(9)?,
        depth: row.get(10)?,
        run_id: row.get(11)?,
        started_at: parse_iso(&started_at).map_err(bad_column)?,
        last_activity: parse_iso(&last_activity).map_err(bad_column)?,
        escalation_level: row.get(14)?,
        stalled_since: stalled_since
            .map(|raw| parse_iso(&raw).map_err(bad_column))
            .transpose()?,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    let started_at: String = row.get(1)?;
    let completed_at: Option<String> = row.get(2)?;
    Ok(Run {
        id: row.get(0)?,
        started_at: parse_iso(&started_at).map_err(bad_column)?,
        completed_at: completed_at
            .map(|raw| parse_iso(&raw).map_err(bad_column))
            .transpose()?,
        objective: row.get(3)?,
    })
}

pub(crate) fn bad_column(err: Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn sample_session(name: &str) -> Session {
        let now = Utc::now();
        Session {
            id: format!("sess-{name}"),
            agent_name: name.to_string(),
            capability: Capability::Builder,
            worktree_path: PathBuf::from(format!("/tmp/worktrees/{name}")),
            branch_name: format!("overstory/{name}/bd-1"),
            bead_id: "bd-1".to_string(),
            tmux_session: format!("overstory-demo-{name}"),
            state: SessionState::Booting,
            pid: Some(4242),
            parent_agent: None,
            depth: 0,
            run_id: None,
            started_at: now,
            last_activity: now,
            escalation_level: 0,
            stalled_since: None,
        }
    }

    fn open_store(temp: &TempDir) -> SessionStore {
        SessionStore::open(&temp.path().join("sessions.db")).unwrap()
    }

    #[test]
    fn test_upsert_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let session = sample_session("alice");
        store.upsert(&session).unwrap();

        let loaded = store.get_by_name("alice").unwrap().unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.capability, Capability::Builder);
        assert_eq!(loaded.branch_name, "overstory/alice/bd-1");
        assert_eq!(loaded.state, SessionState::Booting);
        assert_eq!(loaded.pid, Some(4242));
        // millisecond precision survives the roundtrip
        assert_eq!(to_iso(loaded.started_at), to_iso(session.started_at));
    }

    #[test]
    fn test_upsert_replaces_by_agent_name() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let mut session = sample_session("alice");
        store.upsert(&session).unwrap();

        session.state = SessionState::Working;
        session.bead_id = "bd-2".to_string();
        store.upsert(&session).unwrap();

        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].bead_id, "bd-2");
    }

    #[test]
    fn test_get_active_excludes_terminal() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        for (name, state) in [
            ("a", SessionState::Booting),
            ("b", SessionState::Working),
            ("c", SessionState::Stalled),
            ("d", SessionState::Completed),
            ("e", SessionState::Zombie),
        ] {
            let mut session = sample_session(name);
            session.state = state;
            store.upsert(&session).unwrap();
        }
        let active = store.get_active().unwrap();
        let names: Vec<_> = active.iter().map(|s| s.agent_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_update_last_activity_revives_zombie_and_booting() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);

        for (name, state) in [
            ("z", SessionState::Zombie),
            ("b", SessionState::Booting),
            ("s", SessionState::Stalled),
            ("done", SessionState::Completed),
        ] {
            let mut session = sample_session(name);
            session.state = state;
            store.upsert(&session).unwrap();
            store.update_last_activity(name).unwrap();
        }

        assert_eq!(
            store.get_by_name("z").unwrap().unwrap().state,
            SessionState::Working
        );
        assert_eq!(
            store.get_by_name("b").unwrap().unwrap().state,
            SessionState::Working
        );
        assert_eq!(
            store.get_by_name("s").unwrap().unwrap().state,
            SessionState::Working
        );
        // completed stays completed: terminal states absorb, except the
        // zombie revival above which is the documented liveness proof
        assert_eq!(
            store.get_by_name("done").unwrap().unwrap().state,
            SessionState::Completed
        );
    }

    #[test]
    fn test_update_state_stalled_sets_stalled_since() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.upsert(&sample_session("alice")).unwrap();

        store.update_state("alice", SessionState::Stalled).unwrap();
        let session = store.get_by_name("alice").unwrap().unwrap();
        assert_eq!(session.state, SessionState::Stalled);
        assert!(session.stalled_since.is_some());

        store.update_state("alice", SessionState::Working).unwrap();
        let session = store.get_by_name("alice").unwrap().unwrap();
        assert!(session.stalled_since.is_none());
    }

    #[test]
    fn test_runs_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        store.create_run("run-1", "ship the feature").unwrap();

        let run = store.get_run("run-1").unwrap().unwrap();
        assert_eq!(run.objective, "ship the feature");
        assert!(run.completed_at.is_none());

        store.complete_run("run-1").unwrap();
        let run = store.get_run("run-1").unwrap().unwrap();
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_legacy_json_import() {
        let temp = TempDir::new().unwrap();
        let legacy = temp.path().join("sessions.json");
        // pre-run_id record: no run_id, no last_activity
        std::fs::write(
            &legacy,
            r#"[{
                "id": "old-1",
                "agent_name": "legacy-agent",
                "capability": "scout",
                "worktree_path": "/tmp/wt",
                "branch_name": "overstory/legacy-agent/bd-9",
                "tmux_session": "overstory-demo-legacy-agent",
                "state": "completed",
                "started_at": "2026-01-02T03:04:05.678Z"
            }]"#,
        )
        .unwrap();

        let store = SessionStore::open(&temp.path().join("sessions.db")).unwrap();
        let session = store.get_by_name("legacy-agent").unwrap().unwrap();
        assert_eq!(session.capability, Capability::Scout);
        assert!(session.run_id.is_none());
        assert_eq!(session.last_activity, session.started_at);
    }

    #[test]
    fn test_legacy_import_skipped_when_db_exists() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("sessions.db");
        let store = SessionStore::open(&db).unwrap();
        store.close();

        std::fs::write(
            temp.path().join("sessions.json"),
            r#"[{"id":"x","agent_name":"late","capability":"scout",
                 "worktree_path":"/tmp","branch_name":"b","tmux_session":"t",
                 "state":"completed","started_at":"2026-01-02T03:04:05.678Z"}]"#,
        )
        .unwrap();

        let store = SessionStore::open(&db).unwrap();
        assert!(store.get_by_name("late").unwrap().is_none());
    }

    #[test]
    fn test_children_lookup() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let mut lead = sample_session("lead-1");
        lead.capability = Capability::Lead;
        store.upsert(&lead).unwrap();

        let mut child = sample_session("builder-1");
        child.parent_agent = Some("lead-1".to_string());
        child.depth = 1;
        store.upsert(&child).unwrap();

        let children = store.get_children("lead-1").unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].agent_name, "builder-1");
    }
}
