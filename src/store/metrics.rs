//! Per-session totals and live burn-rate snapshots.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{checkpoint, now_iso, open_database, store_err};
use crate::errors::Result;

/// Totals recorded when a session completes (or is reconciled away).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub agent_name: String,
    pub bead_id: String,
    pub capability: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub duration_ms: i64,
    pub exit_code: Option<i64>,
    pub merge_result: Option<String>,
    pub parent_agent: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub estimated_cost_usd: Option<f64>,
    pub model_used: Option<String>,
    pub run_id: Option<String>,
}

/// Point-in-time token totals for a live session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub agent_name: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub estimated_cost_usd: Option<f64>,
    pub created_at: String,
}

pub struct MetricsStore {
    conn: Connection,
}

impl MetricsStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = open_database(db_path)?;
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self { conn })
    }

    pub fn close(self) {
        checkpoint(&self.conn);
    }

    pub fn record_session(&self, metrics: &SessionMetrics) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO session_metrics (
                     agent_name, bead_id, capability, started_at, completed_at,
                     duration_ms, exit_code, merge_result, parent_agent,
                     input_tokens, output_tokens, cache_read_tokens,
                     cache_creation_tokens, estimated_cost_usd, model_used, run_id
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    metrics.agent_name,
                    metrics.bead_id,
                    metrics.capability,
                    metrics.started_at,
                    metrics.completed_at,
                    metrics.duration_ms,
                    metrics.exit_code,
                    metrics.merge_result,
                    metrics.parent_agent,
                    metrics.input_tokens,
                    metrics.output_tokens,
                    metrics.cache_read_tokens,
                    metrics.cache_creation_tokens,
                    metrics.estimated_cost_usd,
                    metrics.model_used,
                    metrics.run_id,
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    pub fn record_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO metrics_snapshots (
                     agent_name, input_tokens, output_tokens, cache_read_tokens,
                     cache_creation_tokens, estimated_cost_usd, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    snapshot.agent_name,
                    snapshot.input_tokens,
                    snapshot.output_tokens,
                    snapshot.cache_read_tokens,
                    snapshot.cache_creation_tokens,
                    snapshot.estimated_cost_usd,
                    if snapshot.created_at.is_empty() {
                        now_iso()
                    } else {
                        snapshot.created_at.clone()
                    },
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    pub fn sessions_by_agent(&self, agent_name: &str) -> Result<Vec<SessionMetrics>> {
        self.query_metrics(
            &format!("{SELECT_METRICS} WHERE agent_name = ?1 ORDER BY started_at"),
            params![agent_name],
        )
    }

    pub fn sessions_by_run(&self, run_id: &str) -> Result<Vec<SessionMetrics>> {
        self.query_metrics(
            &format!("{SELECT_METRICS} WHERE run_id = ?1 ORDER BY started_at"),
            params![run_id],
        )
    }

    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<SessionMetrics>> {
        self.query_metrics(
            &format!("{SELECT_METRICS} ORDER BY started_at DESC LIMIT ?1"),
            params![limit],
        )
    }

    fn query_metrics(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<SessionMetrics>> {
        let mut stmt = self.conn.prepare(sql).map_err(store_err)?;
        let rows = stmt
            .query_map(params, row_to_metrics)
            .map_err(store_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)?;
        Ok(rows)
    }

    /// The most recent snapshot per agent.
    pub fn latest_snapshots(&self) -> Result<Vec<MetricsSnapshot>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT agent_name, input_tokens, output_tokens, cache_read_tokens,
                        cache_creation_tokens, estimated_cost_usd, created_at
                 FROM metrics_snapshots s
                 WHERE created_at = (
                     SELECT MAX(created_at) FROM metrics_snapshots
                     WHERE agent_name = s.agent_name
                 )
                 GROUP BY agent_name
                 ORDER BY agent_name",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], row_to_snapshot)
            .map_err(store_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)?;
        Ok(rows)
    }

    pub fn average_duration_ms(&self) -> Result<Option<f64>> {
        self.conn
            .query_row(
                "SELECT AVG(duration_ms) FROM session_metrics WHERE completed_at IS NOT NULL",
                [],
                |row| row.get::<_, Option<f64>>(0),
            )
            .optional()
            .map_err(store_err)
            .map(Option::flatten)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS session_metrics (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_name            TEXT NOT NULL,
    bead_id               TEXT NOT NULL DEFAULT '',
    capability            TEXT NOT NULL,
    started_at            TEXT NOT NULL,
    completed_at          TEXT,
    duration_ms           INTEGER NOT NULL DEFAULT 0,
    exit_code             INTEGER,
    merge_result          TEXT,
    parent_agent          TEXT,
    input_tokens          INTEGER NOT NULL DEFAULT 0,
    output_tokens         INTEGER NOT NULL DEFAULT 0,
    cache_read_tokens     INTEGER NOT NULL DEFAULT 0,
    cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
    estimated_cost_usd    REAL,
    model_used            TEXT,
    run_id                TEXT
);
CREATE INDEX IF NOT EXISTS idx_metrics_agent ON session_metrics(agent_name, started_at);
CREATE INDEX IF NOT EXISTS idx_metrics_run ON session_metrics(run_id, started_at);

CREATE TABLE IF NOT EXISTS metrics_snapshots (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_name            TEXT NOT NULL,
    input_tokens          INTEGER NOT NULL DEFAULT 0,
    output_tokens         INTEGER NOT NULL DEFAULT 0,
    cache_read_tokens     INTEGER NOT NULL DEFAULT 0,
    cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
    estimated_cost_usd    REAL,
    created_at            TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_agent ON metrics_snapshots(agent_name, created_at);
";

const SELECT_METRICS: &str = "SELECT agent_name, bead_id, capability, started_at, completed_at, \
     duration_ms, exit_code, merge_result, parent_agent, input_tokens, \
     output_tokens, cache_read_tokens, cache_creation_tokens, \
     estimated_cost_usd, model_used, run_id FROM session_metrics";

fn row_to_metrics(row: &Row<'_>) -> rusqlite::Result<SessionMetrics> {
    Ok(SessionMetrics {
        agent_name: row.get(0)?,
        bead_id: row.get(1)?,
        capability: row.get(2)?,
        started_at: row.get(3)?,
        completed_at: row.get(4)?,
        duration_ms: row.get(5)?,
        exit_code: row.get(6)?,
        merge_result: row.get(7)?,
        parent_agent: row.get(8)?,
        input_tokens: row.get(9)?,
        output_tokens: row.get(10)?,
        cache_read_tokens: row.get(11)?,
        cache_creation_tokens: row.get(12)?,
        estimated_cost_usd: row.get(13)?,
        model_used: row.get(14)?,
        run_id: row.get(15)?,
    })
}

fn row_to_snapshot(row: &Row<'_>) -> rusqlite::Result<MetricsSnapshot> {
    Ok(MetricsSnapshot {
        agent_name: row.get(0)?,
        input_tokens: row.get(1)?,
        output_tokens: row.get(2)?,
        cache_read_tokens: row.get(3)?,
        cache_creation_tokens: row.get(4)?,
        estimated_cost_usd: row.get(5)?,
        created_at: row.get(6)?,
    })
}
