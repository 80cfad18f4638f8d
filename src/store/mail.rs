//! Durable mail rows, deliver-once-per-recipient.
//!
//! The broker (`crate::mail`) owns addressing, broadcast fan-out, and
//! nudge markers; this store only persists and queries rows.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::sessions::bad_column;
use super::{checkpoint, now_iso, open_database, store_err};
use crate::errors::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl MailPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            MailPriority::Low => "low",
            MailPriority::Normal => "normal",
            MailPriority::High => "high",
            MailPriority::Urgent => "urgent",
        }
    }
}

impl fmt::Display for MailPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MailPriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(MailPriority::Low),
            "normal" => Ok(MailPriority::Normal),
            "high" => Ok(MailPriority::High),
            "urgent" => Ok(MailPriority::Urgent),
            other => Err(Error::Mail(format!("unknown priority '{other}'"))),
        }
    }
}

/// Message type: semantic types for free-form agent chatter, protocol types
/// for the coordination choreography.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailType {
    // semantic
    Status,
    Question,
    Result,
    Error,
    // protocol
    WorkerDone,
    MergeReady,
    Merged,
    MergeFailed,
    Escalation,
    HealthCheck,
    Dispatch,
    Assign,
}

impl MailType {
    /// Protocol types drive the coordination choreography and always
    /// trigger an auto-nudge when they signal required attention.
    pub fn is_protocol(self) -> bool {
        matches!(
            self,
            MailType::WorkerDone
                | MailType::MergeReady
                | MailType::Merged
                | MailType::MergeFailed
                | MailType::Escalation
                | MailType::HealthCheck
                | MailType::Dispatch
                | MailType::Assign
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MailType::Status => "status",
            MailType::Question => "question",
            MailType::Result => "result",
            MailType::Error => "error",
            MailType::WorkerDone => "worker_done",
            MailType::MergeReady => "merge_ready",
            MailType::Merged => "merged",
            MailType::MergeFailed => "merge_failed",
            MailType::Escalation => "escalation",
            MailType::HealthCheck => "health_check",
            MailType::Dispatch => "dispatch",
            MailType::Assign => "assign",
        }
    }
}

impl fmt::Display for MailType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MailType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "status" => Ok(MailType::Status),
            "question" => Ok(MailType::Question),
            "result" => Ok(MailType::Result),
            "error" => Ok(MailType::Error),
            "worker_done" => Ok(MailType::WorkerDone),
            "merge_ready" => Ok(MailType::MergeReady),
            "merged" => Ok(MailType::Merged),
            "merge_failed" => Ok(MailType::MergeFailed),
            "escalation" => Ok(MailType::Escalation),
            "health_check" => Ok(MailType::HealthCheck),
            "dispatch" => Ok(MailType::Dispatch),
            "assign" => Ok(MailType::Assign),
            other => Err(Error::Mail(format!("unknown mail type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(rename = "type")]
    pub mail_type: MailType,
    pub priority: MailPriority,
    pub payload: Option<String>,
    pub read: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct MailFilter {
    pub from: Option<String>,
    pub to: Option<String>,
    pub unread: Option<bool>,
    pub limit: Option<usize>,
}

/// Purge target selection; exactly one of the fields is honored in the
/// order `all` > `older_than_ms` > `agent_name`.
#[derive(Debug, Clone, Default)]
pub struct PurgeFilter {
    pub all: bool,
    pub older_than_ms: Option<i64>,
    pub agent_name: Option<String>,
}

/// Result of `mark_read`; re-reading is idempotent.
#[derive(Debug, Clone, Serialize)]
pub struct MarkReadResult {
    pub id: String,
    pub already_read: bool,
}

pub struct MailStore {
    conn: Connection,
}

impl MailStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = open_database(db_path)?;
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self { conn })
    }

    pub fn close(self) {
        checkpoint(&self.conn);
    }

    /// Insert one row addressed to one concrete recipient.
    pub fn insert(
        &self,
        id: &str,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
        mail_type: MailType,
        priority: MailPriority,
        payload: Option<&str>,
    ) -> Result<MailMessage> {
        let created_at = now_iso();
        self.conn
            .execute(
                "INSERT INTO mail (id, from_agent, to_agent, subject, body,
                                   mail_type, priority, payload, read, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)",
                params![
                    id,
                    from,
                    to,
                    subject,
                    body,
                    mail_type.as_str(),
                    priority.as_str(),
                    payload,
                    created_at,
                ],
            )
            .map_err(store_err)?;
        Ok(MailMessage {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            mail_type,
            priority,
            payload: payload.map(ToString::to_string),
            read: false,
            created_at,
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<MailMessage>> {
        self.conn
            .query_row(
                &format!("{SELECT_MAIL} WHERE id = ?1"),
                params![id],
                row_to_mail,
            )
            .optional()
            .map_err(store_err)
    }

    /// Ordered by `created_at` (FIFO per recipient).
    pub fn get_all(&self, filter: &MailFilter) -> Result<Vec<MailMessage>> {
        let mut sql = format!("{SELECT_MAIL} WHERE 1=1");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(from) = &filter.from {
            sql.push_str(&format!(" AND from_agent = ?{}", params.len() + 1));
            params.push(Box::new(from.clone()));
        }
        if let Some(to) = &filter.to {
            sql.push_str(&format!(" AND to_agent = ?{}", params.len() + 1));
            params.push(Box::new(to.clone()));
        }
        if let Some(unread) = filter.unread {
            sql.push_str(if unread { " AND read = 0" } else { " AND read = 1" });
        }
        sql.push_str(" ORDER BY created_at, rowid");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.conn.prepare(&sql).map_err(store_err)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            params.iter().map(std::convert::AsRef::as_ref).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), row_to_mail)
            .map_err(store_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(store_err)?;
        Ok(rows)
    }

    /// Unread mail for one recipient, FIFO.
    pub fn unread_for(&self, agent: &str) -> Result<Vec<MailMessage>> {
        self.get_all(&MailFilter {
            to: Some(agent.to_string()),
            unread: Some(true),
            ..MailFilter::default()
        })
    }

    /// Idempotent: marking an already-read message reports it as such.
    pub fn mark_read(&self, id: &str) -> Result<MarkReadResult> {
        let message = self
            .get(id)?
            .ok_or_else(|| Error::Mail(format!("no message with id '{id}'")))?;
        if message.read {
            return Ok(MarkReadResult {
                id: id.to_string(),
                already_read: true,
            });
        }
        self.conn
            .execute("UPDATE mail SET read = 1 WHERE id = ?1", params![id])
            .map_err(store_err)?;
        Ok(MarkReadResult {
            id: id.to_string(),
            already_read: false,
        })
    }

    /// Returns the number of rows removed.
    pub fn purge(&self, filter: &PurgeFilter) -> Result<usize> {
        if filter.all {
            return self.conn.execute("DELETE FROM mail", []).map_err(store_err);
        }
        if let Some(older_than_ms) = filter.older_than_ms {
            let cutoff = chrono::Utc::now() - chrono::Duration::milliseconds(older_than_ms);
            return self
                .conn
                .execute(
                    "DELETE FROM mail WHERE created_at < ?1",
                    params![super::to_iso(cutoff)],
                )
                .map_err(store_err);
        }
        if let Some(agent) = &filter.agent_name {
            return self
                .conn
                .execute(
                    "DELETE FROM mail WHERE to_agent = ?1 OR from_agent = ?1",
                    params![agent],
                )
                .map_err(store_err);
        }
        Err(Error::Mail(
            "purge requires --all, --older-than, or --agent".to_string(),
        ))
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS mail (
    id         TEXT PRIMARY KEY,
    from_agent TEXT NOT NULL,
    to_agent   TEXT NOT NULL,
    subject    TEXT NOT NULL,
    body       TEXT NOT NULL,
    mail_type  TEXT NOT NULL,
    priority   TEXT NOT NULL,
    payload    TEXT,
    read       INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_mail_recipient_read ON mail(to_agent, read);
CREATE INDEX IF NOT EXISTS idx_mail_from ON mail(from_agent, created_at);
CREATE INDEX IF NOT EXISTS idx_mail_to ON mail(to_agent, created_at);
";

const SELECT_MAIL: &str = "SELECT id, from_agent, to_agent, subject, body, mail_type, \
     priority, payload, read, created_at FROM mail";

fn row_to_mail(row: &Row<'_>) -> rusqlite::Result<MailMessage> {
    let mail_type: String = row.get(5)?;
    let priority: String = row.get(6)?;
    let read: i64 = row.get(8)?;
    Ok(MailMessage {
        id: row.get(0)?,
        from: row.get(1)?,
        to: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        mail_type: mail_type.parse().map_err(bad_column)?,
        priority: priority.parse().map_err(bad_column)?,
        payload: row.get(7)?,
        read: read != 0,
        created_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(temp: &TempDir) -> MailStore {
        MailStore::open(&temp.path().join("mail.db")).unwrap()
    }

    fn insert_basic(store: &MailStore, id: &str, from: &str, to: &str) -> MailMessage {
        store
            .insert(
                id,
                from,
                to,
                "subject",
                "body",
                MailType::Status,
                MailPriority::Normal,
                None,
            )
            .unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        insert_basic(&store, "m1", "lead-1", "builder-1");

        let message = store.get("m1").unwrap().unwrap();
        assert_eq!(message.from, "lead-1");
        assert_eq!(message.to, "builder-1");
        assert!(!message.read);
    }

    #[test]
    fn test_unread_fifo_order() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        insert_basic(&store, "m1", "a", "builder-1");
        insert_basic(&store, "m2", "b", "builder-1");
        insert_basic(&store, "m3", "c", "other");

        let unread = store.unread_for("builder-1").unwrap();
        let ids: Vec<_> = unread.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[test]
    fn test_mark_read_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        insert_basic(&store, "m1", "a", "b");

        let first = store.mark_read("m1").unwrap();
        assert!(!first.already_read);
        let second = store.mark_read("m1").unwrap();
        assert!(second.already_read);
    }

    #[test]
    fn test_mark_read_unknown_id() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        let err = store.mark_read("missing").unwrap_err();
        assert_eq!(err.kind(), "Mail");
    }

    #[test]
    fn test_filter_unread_flag() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        insert_basic(&store, "m1", "a", "b");
        insert_basic(&store, "m2", "a", "b");
        store.mark_read("m1").unwrap();

        let read = store
            .get_all(&MailFilter {
                unread: Some(false),
                ..MailFilter::default()
            })
            .unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].id, "m1");
    }

    #[test]
    fn test_purge_by_agent() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        insert_basic(&store, "m1", "alice", "bob");
        insert_basic(&store, "m2", "bob", "carol");
        insert_basic(&store, "m3", "carol", "dave");

        let removed = store
            .purge(&PurgeFilter {
                agent_name: Some("bob".to_string()),
                ..PurgeFilter::default()
            })
            .unwrap();
        assert_eq!(removed, 2);
        assert!(store.get("m3").unwrap().is_some());
    }

    #[test]
    fn test_purge_all() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        insert_basic(&store, "m1", "a", "b");
        let removed = store
            .purge(&PurgeFilter {
                all: true,
                ..PurgeFilter::default()
            })
            .unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_purge_requires_a_target() {
        let temp = TempDir::new().unwrap();
        let store = open_store(&temp);
        assert!(store.purge(&PurgeFilter::default()).is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(MailPriority::Urgent > MailPriority::High);
        assert!(MailPriority::High > MailPriority::Normal);
        assert!(MailPriority::Normal > MailPriority::Low);
    }

    #[test]
    fn test_protocol_types() {
        assert!(MailType::WorkerDone.is_protocol());
        assert!(MailType::MergeReady.is_protocol());
        assert!(!MailType::Status.is_protocol());
        assert!(!MailType::Error.is_protocol());
    }
}
