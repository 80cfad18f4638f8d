//! Persistent agent identity.
//!
//! Sessions are ephemeral; identity files under
//! `.overstory/agents/{name}/identity.json` survive across lifetimes and
//! accumulate a small CV (sessions run, last seen).

use std::fs;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::paths::OverstoryHome;
use crate::store::{now_iso, Capability};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub name: String,
    pub capability: Capability,
    pub created_at: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub sessions_run: u64,
    #[serde(default)]
    pub last_seen: Option<String>,
}

/// Load an agent's identity, creating the record on first run.
pub fn load_or_create(
    home: &OverstoryHome,
    name: &str,
    capability: Capability,
    domains: &[String],
) -> Result<AgentIdentity> {
    let path = home.identity_file(name);
    if let Ok(raw) = fs::read_to_string(&path) {
        let identity: AgentIdentity = serde_json::from_str(&raw)
            .map_err(|e| Error::Agent(format!("corrupt identity {}: {e}", path.display())))?;
        return Ok(identity);
    }

    let identity = AgentIdentity {
        name: name.to_string(),
        capability,
        created_at: now_iso(),
        domains: domains.to_vec(),
        sessions_run: 0,
        last_seen: None,
    };
    save(home, &identity)?;
    Ok(identity)
}

/// Bump the session counter and last-seen stamp.
pub fn record_session(home: &OverstoryHome, name: &str) -> Result<()> {
    let path = home.identity_file(name);
    let raw = fs::read_to_string(&path)
        .map_err(|e| Error::Agent(format!("no identity for '{name}': {e}")))?;
    let mut identity: AgentIdentity = serde_json::from_str(&raw)?;
    identity.sessions_run += 1;
    identity.last_seen = Some(now_iso());
    save(home, &identity)
}

pub fn load(home: &OverstoryHome, name: &str) -> Result<Option<AgentIdentity>> {
    let path = home.identity_file(name);
    match fs::read_to_string(&path) {
        Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Agent(format!(
            "cannot read {}: {e}",
            path.display()
        ))),
    }
}

fn save(home: &OverstoryHome, identity: &AgentIdentity) -> Result<()> {
    let path = home.identity_file(&identity.name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::Agent(format!("cannot create {}: {e}", parent.display())))?;
    }
    let body = serde_json::to_string_pretty(identity)?;
    fs::write(&path, body)
        .map_err(|e| Error::Agent(format!("cannot write {}: {e}", path.display())))?;
    Ok(())
}
