//! FIFO queue of branches awaiting integration.
//!
//! Status transitions are monotonic: `pending → merging → merged | conflict
//! | failed`; a regression (merged back to pending) is rejected.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::sessions::bad_column;
use super::{checkpoint, now_iso, open_database, store_err};
use crate::errors::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStatus {
    Pending,
    Merging,
    Merged,
    Conflict,
    Failed,
}

impl MergeStatus {
    /// Monotonic rank; transitions may only move forward.
    fn rank(self) -> u8 {
        match self {
            MergeStatus::Pending => 0,
            MergeStatus::Merging => 1,
            MergeStatus::Merged | MergeStatus::Conflict | MergeStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MergeStatus::Pending => "pending",
            MergeStatus::Merging => "merging",
            MergeStatus::Merged => "merged",
            MergeStatus::Conflict => "conflict",
            MergeStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MergeStatus::Pending),
            "merging" => Ok(MergeStatus::Merging),
            "merged" => Ok(MergeStatus::Merged),
            "conflict" => Ok(MergeStatus::Conflict),
            "failed" => Ok(MergeStatus::Failed),
            other => Err(Error::Merge(format!("unknown merge status '{other}'"))),
        }
    }
}

/// Resolver tier that settled (or last attempted) a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolveTier {
    CleanMerge,
    ContentWins,
    AiAssist,
    Reimagine,
}

impl ResolveTier {
    pub const LADDER: [ResolveTier; 4] = [
        ResolveTier::CleanMerge,
        ResolveTier::ContentWins,
        ResolveTier::AiAssist,
        ResolveTier::Reimagine,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResolveTier::CleanMerge => "clean-merge",
            ResolveTier::ContentWins => "content-wins",
            ResolveTier::AiAssist => "ai-assist",
            ResolveTier::Reimagine => "reimagine",
        }
    }
}

impl fmt::Display for ResolveTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolveTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "clean-merge" => Ok(ResolveTier::CleanMerge),
            "content-wins" => Ok(ResolveTier::ContentWins),
            "ai-assist" => Ok(ResolveTier::AiAssist),
            "reimagine" => Ok(ResolveTier::Reimagine),
            other => Err(Error::Merge(format!("unknown resolve tier '{other}'"))),
        }
    }
}

/// A branch awaiting integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeEntry {
    pub branch_name: String,
    pub bead_id: String,
    pub agent_name: String,
    pub files_modified: Vec<String>,
    pub status: MergeStatus,
    pub resolved_tier: Option<ResolveTier>,
    pub created_at: String,
}

pub struct MergeQueue {
    conn: Connection,
}

impl MergeQueue {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = open_database(db_path)?;
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self { conn })
    }

    pub fn close(self) {
        checkpoint(&self.conn);
    }

    /// Create a `pending` entry. Re-enqueueing a branch that is already
    /// queued returns the existing entry untouched.
    pub fn enqueue(
        &self,
        branch_name: &str,
        bead_id: &str,
        agent_name: &str,
        files_modified: &[String],
    ) -> Result<MergeEntry> {
        if let Some(existing) = self.get(branch_name)? {
            return Ok(existing);
        }
        let created_at = now_iso();
        self.conn
            .execute(
                "INSERT INTO merge_queue
                     (branch_name, bead_id, agent_name, files_modified, status,
                      resolved_tier, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', NULL, ?5)",
                params![
                    branch_name,
                    bead_id,
                    agent_name,
                    serde_json::to_string(files_modified)?,
                    created_at,
                ],
            )
            .map_err(store_err)?;
        Ok(MergeEntry {
            branch_name: branch_name.to_string(),
            bead_id: bead_id.to_string(),
            agent_name: agent_name.to_string(),
            files_modified: files_modified.to_vec(),
            status: MergeStatus::Pending,
            resolved_tier: None,
            created_at,
        })
    }

    pub fn get(&self, branch_name: &str) -> Result<Option<MergeEntry>> {
        self.conn
            .query_row(
                &format!("{SELECT_ENTRY} WHERE branch_name = ?1"),
                params![branch_name],
                row_to_entry,
            )
            .optional()
            .map_err(store_err)
    }

    /// Entries ordered FIFO by `created_at`, optionally filtered by status.
    pub fn list(&self, status: Option<MergeStatus>) -> Result<Vec<MergeEntry>> {
        let mut sql = format!("{SELECT_ENTRY}");
        if status.is_some() {
            sql.push_str(" WHERE status = ?1");
        }
        sql.push_str(" ORDER BY created_at, rowid");

        let mut stmt = self.conn.prepare(&sql).map_err(store_err)?;
        let rows = match status {
            Some(s) => stmt
                .query_map(params![s.as_str()], row_to_entry)
                .map_err(store_err)?
                .collect::<std::result::Result<Vec<_>, _>>(),
            None => stmt
                .query_map([], row_to_entry)
                .map_err(store_err)?
                .collect::<std::result::Result<Vec<_>, _>>(),
        }
        .map_err(store_err)?;
        Ok(rows)
    }

    /// Advance an entry's status, recording the tier that settled it.
    pub fn update_status(
        &self,
        branch_name: &str,
        status: MergeStatus,
        tier: Option<ResolveTier>,
    ) -> Result<()> {
        let entry = self
            .get(branch_name)?
            .ok_or_else(|| Error::Merge(format!("branch '{branch_name}' is not queued")))?;
        if status.rank() < entry.status.rank() {
            return Err(Error::Merge(format!(
                "cannot move branch '{branch_name}' from {} back to {status}",
                entry.status
            )));
        }
        self.conn
            .execute(
                "UPDATE merge_queue SET status = ?2, resolved_tier = ?3 WHERE branch_name = ?1",
                params![branch_name, status.as_str(), tier.map(ResolveTier::as_str)],
            )
            .map_err(store_err)?;
        Ok(())
    }

    pub fn remove(&self, branch_name: &str) -> Result<bool> {
        let n = self
            .conn
            .execute(
                "DELETE FROM merge_queue WHERE branch_name = ?1",
                params![branch_name],
            )
            .map_err(store_err)?;
        Ok(n > 0)
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS merge_queue (
    branch_name    TEXT PRIMARY KEY,
    bead_id        TEXT NOT NULL DEFAULT '',
    agent_name     TEXT NOT NULL,
    files_modified TEXT NOT NULL DEFAULT '[]',
    status         TEXT NOT NULL DEFAULT 'pending',
    resolved_tier  TEXT,
    created_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_merge_queue_status ON merge_queue(status, created_at);
";

const SELECT_ENTRY: &str = "SELECT branch_name, bead_id, agent_name, files_modified, status, \
     resolved_tier, created_at FROM merge_queue";

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<MergeEntry> {
    let files: String = row.get(3)?;
    let status: String = row.get(4)?;
    let tier: Option<String> = row.get(5)?;
    Ok(MergeEntry {
        branch_name: row.get(0)?,
        bead_id: row.get(1)?,
        agent_name: row.get(2)?,
        files_modified: serde_json::from_str(&files).unwrap_or_default(),
        status: status.parse().map_err(bad_column)?,
        resolved_tier: tier.map(|raw| raw.parse().map_err(bad_column)).transpose()?,
        created_at: row.get(6)?,
    })
}
