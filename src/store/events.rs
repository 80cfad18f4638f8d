//! Append-only observability events.
//!
//! Events are never updated after insert, with one exception: correlating a
//! `tool_end` against its most recent unclosed `tool_start` sets
//! `tool_duration_ms` exactly once.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{checkpoint, now_iso, open_database, parse_iso, store_err};
use crate::errors::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ToolStart,
    ToolEnd,
    SessionStart,
    SessionEnd,
    MailSent,
    MailReceived,
    Spawn,
    Error,
    Custom,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::ToolStart => "tool_start",
            EventType::ToolEnd => "tool_end",
            EventType::SessionStart => "session_start",
            EventType::SessionEnd => "session_end",
            EventType::MailSent => "mail_sent",
            EventType::MailReceived => "mail_received",
            EventType::Spawn => "spawn",
            EventType::Error => "error",
            EventType::Custom => "custom",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tool_start" => Ok(EventType::ToolStart),
            "tool_end" => Ok(EventType::ToolEnd),
            "session_start" => Ok(EventType::SessionStart),
            "session_end" => Ok(EventType::SessionEnd),
            "mail_sent" => Ok(EventType::MailSent),
            "mail_received" => Ok(EventType::MailReceived),
            "spawn" => Ok(EventType::Spawn),
            "error" => Ok(EventType::Error),
            "custom" => Ok(EventType::Custom),
            other => Err(Error::Store(format!("unknown event type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            EventLevel::Debug => "debug",
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        }
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "debug" => Ok(EventLevel::Debug),
            "info" => Ok(EventLevel::Info),
            "warn" => Ok(EventLevel::Warn),
            "error" => Ok(EventLevel::Error),
            other => Err(Error::Store(format!("unknown event level '{other}'"))),
        }
    }
}

/// A stored event row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub run_id: Option<String>,
    pub agent_name: String,
    pub session_id: Option<String>,
    pub event_type: EventType,
    pub tool_name: Option<String>,
    pub tool_args: Option<String>,
    pub tool_duration_ms: Option<i64>,
    pub level: EventLevel,
    pub data: Option<String>,
    pub created_at: String,
}

/// Insert payload; `id` and `created_at` are server-assigned.
#[derive(Debug, Clone, Default)]
pub struct NewEvent {
    pub run_id: Option<String>,
    pub agent_name: String,
    pub session_id: Option<String>,
    pub event_type: Option<EventType>,
    pub tool_name: Option<String>,
    pub tool_args: Option<String>,
    pub level: Option<EventLevel>,
    pub data: Option<serde_json::Value>,
}

impl NewEvent {
    pub fn new(agent_name: &str, event_type: EventType) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            event_type: Some(event_type),
            ..Self::default()
        }
    }
}

/// Query options shared by the observability commands.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub agent_name: Option<String>,
    pub run_id: Option<String>,
    pub event_type: Option<EventType>,
    pub level: Option<EventLevel>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<usize>,
}

pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = open_database(db_path)?;
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self { conn })
    }

    pub fn close(self) {
        checkpoint(&self.conn);
    }

    /// Append one event; returns the assigned row id.
    pub fn insert(&self, event: &NewEvent) -> Result<i64> {
        let data = event
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn
            .execute(
                "INSERT INTO events (
                     run_id, agent_name, session_id, event_type, tool_name,
                     tool_args, tool_duration_ms, level, data, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, ?9)",
                params![
                    event.run_id,
                    event.agent_name,
                    event.session_id,
                    event.event_type.unwrap_or(EventType::Custom).as_str(),
                    event.tool_name,
                    event.tool_args,
                    event.level.unwrap_or(EventLevel::Info).as_str(),
                    data,
                    now_iso(),
                ],
            )
            .map_err(store_err)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Close the most recent unclosed `tool_start` for `(agent, tool)`,
    /// setting its duration to `now − started`. Returns `(id, duration_ms)`
    /// or `None` when no open start exists (the end is still recorded by
    /// the caller, just without a duration).
    pub fn correlate_tool_end(&self, agent_name: &str, tool_name: &str) -> Result<Option<(i64, i64)>> {
        let open_start: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT id, created_at FROM events
                 WHERE agent_name = ?1 AND tool_name = ?2
                   AND event_type = 'tool_start' AND tool_duration_ms IS NULL
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1",
                params![agent_name, tool_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(store_err)?;

        let Some((id, started_at)) = open_start else {
            return Ok(None);
        };

        let started = parse_iso(&started_at)?;
        let duration_ms = (chrono::Utc::now() - started).num_milliseconds().max(0);
        self.conn
            .execute(
                "UPDATE events SET tool_duration_ms = ?2 WHERE id = ?1",
                params![id, duration_ms],
            )
            .map_err(store_err)?;
        Ok(Some((id, duration_ms)))
    }

    pub fn query(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let mut sql = String::from(
            "SELECT id, run_id, agent_name, session_id, event_type, tool_name, \
             tool_args, tool_duration_ms, level, data, created_at FROM events WHERE 1=1",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(agent) = &filter.agent_name {
            sql.push_str(&format!(" AND agent_name = ?{}", params.len() + 1));
            params.push(Box::new(agent.clone()));
        }
        if let Some(run) = &filter.run_id {
            sql.push_str(&format!(" AND run_id = ?{}", params.len() + 1));
            params.push(Box::new(run.clone()));
        }
        if let Some(event_type) = filter.event_type {
            sql.push_str(&format!(" AND event_type = ?{}", params.len() + 1));
            params.push(Box::new(event_type.as_str().to_string()));
        }
        if let Some(level) = filter.level {
            sql.push_str(&format!(" AND level = ?{}", params.len() + 1));
            params.push(Box::new(level.as_str().to_string()));
        }
        if let Some(since) = &filter.since {
            sql.push_str(&format!(" AND created_at >= ?{}", params.len() + 1));
            params.push(Box::new(since.clone()));
        }
        if let Some(until) = &filter.until {
            sql.push_str(&format!(" AND created_at <= ?{}", params.len() + 1));
            params.push(Box::new(until.clone()));
        }

        sql.push_str(" ORDER BY created_at, id");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&sql).map_err(store_err)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            params.iter().map(std::convert::AsRef::as_ref).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), row_to_event)
            .map_err(store_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)?;
        Ok(rows)
    }

    /// Most recent events for one agent, newest first.
    pub fn recent_for_agent(&self, agent_name: &str, limit: usize) -> Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, run_id, agent_name, session_id, event_type, tool_name, \
                 tool_args, tool_duration_ms, level, data, created_at FROM events \
                 WHERE agent_name = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![agent_name, limit], row_to_event)
            .map_err(store_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)?;
        Ok(rows)
    }

    pub fn purge_older_than(&self, cutoff_iso: &str) -> Result<usize> {
        self.conn
            .execute(
                "DELETE FROM events WHERE created_at < ?1",
                params![cutoff_iso],
            )
            .map_err(store_err)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id           TEXT,
    agent_name       TEXT NOT NULL,
    session_id       TEXT,
    event_type       TEXT NOT NULL,
    tool_name        TEXT,
    tool_args        TEXT,
    tool_duration_ms INTEGER,
    level            TEXT NOT NULL DEFAULT 'info',
    data             TEXT,
    created_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_agent_created ON events(agent_name, created_at);
CREATE INDEX IF NOT EXISTS idx_events_run_created ON events(run_id, created_at);
CREATE INDEX IF NOT EXISTS idx_events_type_created ON events(event_type, created_at);
CREATE INDEX IF NOT EXISTS idx_events_tool_agent ON events(tool_name, agent_name);
CREATE INDEX IF NOT EXISTS idx_events_errors ON events(created_at) WHERE level = 'error';
";

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let event_type: String = row.get(4)?;
    let level: String = row.get(8)?;
    Ok(Event {
        id: row.get(0)?,
        run_id: row.get(1)?,
        agent_name: row.get(2)?,
        session_id: row.get(3)?,
        event_type: event_type.parse().map_err(super::sessions::bad_column)?,
        tool_name: row.get(5)?,
        tool_args: row.get(6)?,
        tool_duration_ms: row.get(7)?,
        level: level.parse().map_err(super::sessions::bad_column)?,
        data: row.get(9)?,
        created_at: row.get(10)?,
    })
}
