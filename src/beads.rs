//! External issue tracker (`bd`) contract.
//!
//! Beads are opaque task ids; the only question the control plane asks the
//! tracker is whether a bead is workable before binding an agent to it.

use std::time::Duration;

use serde::Deserialize;

use crate::agents::process;
use crate::errors::{Error, Result};

const BD_DEADLINE: Duration = Duration::from_secs(10);

/// States in which an agent may be bound to a bead.
const WORKABLE: [&str; 2] = ["open", "in_progress"];

#[derive(Debug, Deserialize)]
struct BeadRecord {
    status: String,
}

/// `bd show <id> --json` and check `status ∈ {open, in_progress}`.
pub async fn is_workable(bead_id: &str) -> Result<bool> {
    let output = process::run_command("bd", &["show", bead_id, "--json"], None, Some(BD_DEADLINE))
        .await
        .map_err(|e| Error::Beads(e.to_string()))?;

    if !output.success() {
        return Err(Error::Beads(format!(
            "bd show {bead_id} failed: {}",
            output.stderr.trim()
        )));
    }
    let record: BeadRecord = serde_json::from_str(output.stdout.trim())
        .map_err(|e| Error::Beads(format!("bd returned invalid JSON for {bead_id}: {e}")))?;
    Ok(status_is_workable(&record.status))
}

fn status_is_workable(status: &str) -> bool {
    WORKABLE.contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workable_statuses() {
        assert!(status_is_workable("open"));
        assert!(status_is_workable("in_progress"));
        assert!(!status_is_workable("closed"));
        assert!(!status_is_workable("blocked"));
        assert!(!status_is_workable(""));
    }
}
