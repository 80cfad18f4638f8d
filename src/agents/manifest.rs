//! Agent manifest: per-capability model defaults, spawn rights, and tool
//! grants, read from `.overstory/agent-manifest.json`.

use std::collections::HashMap;
use std::fs;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::paths::OverstoryHome;
use crate::store::Capability;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CapabilityDef {
    pub model: Option<String>,
    pub can_spawn: bool,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(flatten)]
    pub roles: HashMap<String, CapabilityDef>,
}

impl Manifest {
    /// Load the manifest; a missing file yields built-in defaults.
    pub fn load(home: &OverstoryHome) -> Result<Self> {
        let path = home.manifest_file();
        match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Config(format!("invalid manifest {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::builtin()),
            Err(e) => Err(Error::Config(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Defaults used until `overstory init` writes a manifest: leads,
    /// supervisors, and coordinators may spawn; everyone else may not.
    pub fn builtin() -> Self {
        let mut roles = HashMap::new();
        for capability in Capability::ALL {
            roles.insert(
                capability.as_str().to_string(),
                CapabilityDef {
                    model: None,
                    can_spawn: matches!(
                        capability,
                        Capability::Lead | Capability::Supervisor | Capability::Coordinator
                    ),
                    capabilities: Vec::new(),
                },
            );
        }
        Self { roles }
    }

    pub fn role(&self, capability: Capability) -> Option<&CapabilityDef> {
        self.roles.get(capability.as_str())
    }

    pub fn default_model(&self, capability: Capability) -> Option<&str> {
        self.role(capability).and_then(|def| def.model.as_deref())
    }

    pub fn can_spawn(&self, capability: Capability) -> bool {
        self.role(capability).is_some_and(|def| def.can_spawn)
    }

    /// Write the built-in manifest to disk (used by `init`).
    pub fn write_default(home: &OverstoryHome) -> Result<()> {
        let path = home.manifest_file();
        if path.exists() {
            return Ok(());
        }
        let body = serde_json::to_string_pretty(&Self::builtin())?;
        fs::write(&path, body)
            .map_err(|e| Error::Config(format!("cannot write {}: {e}", path.display())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_spawn_rights() {
        let manifest = Manifest::builtin();
        assert!(manifest.can_spawn(Capability::Lead));
        assert!(manifest.can_spawn(Capability::Coordinator));
        assert!(!manifest.can_spawn(Capability::Builder));
        assert!(!manifest.can_spawn(Capability::Scout));
    }

    #[test]
    fn test_load_missing_uses_builtin() {
        let temp = TempDir::new().unwrap();
        let home = OverstoryHome::at(temp.path());
        let manifest = Manifest::load(&home).unwrap();
        assert!(manifest.role(Capability::Builder).is_some());
    }

    #[test]
    fn test_load_file_overrides() {
        let temp = TempDir::new().unwrap();
        let home = OverstoryHome::at(temp.path());
        std::fs::create_dir_all(home.dir()).unwrap();
        std::fs::write(
            home.manifest_file(),
            r#"{"builder": {"model": "opus", "canSpawn": true, "capabilities": ["edit"]}}"#,
        )
        .unwrap();

        let manifest = Manifest::load(&home).unwrap();
        assert_eq!(manifest.default_model(Capability::Builder), Some("opus"));
        assert!(manifest.can_spawn(Capability::Builder));
        assert!(manifest.role(Capability::Scout).is_none());
    }

    #[test]
    fn test_write_default_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let home = OverstoryHome::at(temp.path());
        std::fs::create_dir_all(home.dir()).unwrap();

        Manifest::write_default(&home).unwrap();
        std::fs::write(home.manifest_file(), "{}").unwrap();
        // second call must not clobber operator edits
        Manifest::write_default(&home).unwrap();
        assert_eq!(
            std::fs::read_to_string(home.manifest_file()).unwrap(),
            "{}"
        );
    }
}
