//! Pending-nudge markers.
//!
//! One JSON file per agent at `.overstory/pending-nudges/{agent}.json`.
//! The latest nudge overwrites any previous one; the marker is cleared by
//! the recipient's next `mail check --inject`. Direct key injection into
//! the recipient's pane is never used: it corrupts in-flight tool I/O.

use std::fs;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::paths::OverstoryHome;
use crate::store::now_iso;

/// Marker content surfaced as a priority banner on the next prompt cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingNudge {
    pub from: String,
    pub reason: String,
    pub subject: String,
    pub message_id: Option<String>,
    pub created_at: String,
}

impl PendingNudge {
    pub fn new(from: &str, reason: &str, subject: &str, message_id: Option<&str>) -> Self {
        Self {
            from: from.to_string(),
            reason: reason.to_string(),
            subject: subject.to_string(),
            message_id: message_id.map(ToString::to_string),
            created_at: now_iso(),
        }
    }

    /// The banner line shown before the mail body on injection.
    pub fn banner(&self) -> String {
        format!(
            "🚨 PRIORITY: {} message from {} — \"{}\"",
            self.reason, self.from, self.subject
        )
    }
}

/// Write (or overwrite) the marker for an agent.
pub fn write_marker(home: &OverstoryHome, agent: &str, nudge: &PendingNudge) -> Result<()> {
    let dir = home.pending_nudges_dir();
    fs::create_dir_all(&dir)
        .map_err(|e| Error::Mail(format!("cannot create {}: {e}", dir.display())))?;
    let path = home.pending_nudge_file(agent);
    let body = serde_json::to_string_pretty(nudge)?;
    fs::write(&path, body).map_err(|e| Error::Mail(format!("cannot write {}: {e}", path.display())))?;
    Ok(())
}

/// Read and remove the marker, if present.
pub fn take_marker(home: &OverstoryHome, agent: &str) -> Result<Option<PendingNudge>> {
    let path = home.pending_nudge_file(agent);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Mail(format!("cannot read {}: {e}", path.display()))),
    };
    let nudge: PendingNudge = serde_json::from_str(&raw)
        .map_err(|e| Error::Mail(format!("corrupt nudge marker {}: {e}", path.display())))?;
    fs::remove_file(&path).ok();
    Ok(Some(nudge))
}

/// Whether an un-consumed marker exists for the agent.
pub fn has_marker(home: &OverstoryHome, agent: &str) -> bool {
    home.pending_nudge_file(agent).exists()
}
