//! Agent lifecycle: tmux adapter, process control, identity, provider
//! invocation, the scheduler, and the watchdog.

pub mod identity;
pub mod manifest;
pub mod process;
pub mod provider;
pub mod sling;
pub mod tmux;
pub mod watchdog;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{Error, Result};

/// Branch naming scheme for worker agents: `overstory/{agent}/{bead}`.
pub const BRANCH_PREFIX: &str = "overstory/";

static AGENT_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]*$").expect("valid agent name pattern"));

/// Validate a human-readable agent name.
pub fn validate_agent_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("name", "agent name must be non-empty"));
    }
    if name.len() > 64 {
        return Err(Error::validation("name", "agent name exceeds 64 characters"));
    }
    if !AGENT_NAME_RE.is_match(name) {
        return Err(Error::validation(
            "name",
            format!("'{name}' must start with a letter and use only letters, digits, '-', '_'"),
        ));
    }
    Ok(())
}

/// Branch name for a worker agent.
pub fn worker_branch(agent: &str, bead_id: &str) -> String {
    format!("{BRANCH_PREFIX}{agent}/{bead_id}")
}

/// Parse `overstory/{agent}/{bead}` back into its parts.
pub fn parse_worker_branch(branch: &str) -> Option<(&str, &str)> {
    let rest = branch.strip_prefix(BRANCH_PREFIX)?;
    let (agent, bead) = rest.split_once('/')?;
    if agent.is_empty() || bead.is_empty() {
        return None;
    }
    Some((agent, bead))
}
