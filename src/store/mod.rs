//! Persistence stores.
//!
//! Five stores, one embedded SQL database file each, all opened in WAL mode
//! with a 5-second busy timeout and `synchronous=NORMAL`. Readers may be
//! concurrent with a single writer; transactions are short (one insert or
//! one update). Closing a store issues a passive WAL checkpoint.

pub mod events;
pub mod mail;
pub mod merge_queue;
pub mod metrics;
pub mod sessions;

pub use events::{Event, EventFilter, EventLevel, EventStore, EventType, NewEvent};
pub use mail::{MailFilter, MailMessage, MailPriority, MailStore, MailType, PurgeFilter};
pub use merge_queue::{MergeEntry, MergeQueue, MergeStatus, ResolveTier};
pub use metrics::{MetricsSnapshot, MetricsStore, SessionMetrics};
pub use sessions::{Capability, Run, Session, SessionState, SessionStore};

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::errors::{Error, Result};

/// Busy-wait budget before a writer gives up on a locked database.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn open_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::Store(format!("cannot create {}: {e}", parent.display())))?;
    }

    let conn = Connection::open(path)
        .map_err(|e| Error::Store(format!("cannot open {}: {e}", path.display())))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|e| Error::Store(format!("cannot set busy timeout: {e}")))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
        .map_err(|e| Error::Store(format!("cannot configure {}: {e}", path.display())))?;
    Ok(conn)
}

/// Passive checkpoint; safe to call with readers still attached.
pub(crate) fn checkpoint(conn: &Connection) {
    let _ = conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);");
}

pub(crate) fn store_err(err: rusqlite::Error) -> Error {
    Error::Store(err.to_string())
}

/// Server-assigned ISO-8601 timestamp with millisecond precision.
///
/// Lexicographic order of these strings matches chronological order, which
/// the stores rely on for `ORDER BY created_at`.
pub fn now_iso() -> String {
    to_iso(Utc::now())
}

pub fn to_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_iso(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Store(format!("bad timestamp '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("events.db");
        let conn = open_database(&path).unwrap();
        checkpoint(&conn);
        assert!(path.exists());
    }

    #[test]
    fn test_wal_mode_enabled() {
        let temp = TempDir::new().unwrap();
        let conn = open_database(&temp.path().join("x.db")).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_iso_roundtrip_and_ordering() {
        let a = now_iso();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = now_iso();
        assert!(a < b);
        let parsed = parse_iso(&a).unwrap();
        assert_eq!(to_iso(parsed), a);
    }
}
