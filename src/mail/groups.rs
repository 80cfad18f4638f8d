//! Operator-defined broadcast groups.
//!
//! The capability groups (`@builders`, `@scouts`, …) resolve against live
//! sessions; named groups declared here are plain member lists stored in
//! `.overstory/groups.json` and addressed the same way (`@{name}`).

use std::collections::BTreeMap;
use std::fs;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::paths::OverstoryHome;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Groups {
    #[serde(flatten)]
    groups: BTreeMap<String, Vec<String>>,
}

fn groups_file(home: &OverstoryHome) -> std::path::PathBuf {
    home.dir().join("groups.json")
}

impl Groups {
    pub fn load(home: &OverstoryHome) -> Self {
        fs::read_to_string(groups_file(home))
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, home: &OverstoryHome) -> Result<()> {
        let path = groups_file(home);
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .map_err(|e| Error::Mail(format!("cannot write {}: {e}", path.display())))?;
        Ok(())
    }

    pub fn create(&mut self, name: &str) -> Result<()> {
        if self.groups.contains_key(name) {
            return Err(Error::Mail(format!("group '{name}' already exists")));
        }
        self.groups.insert(name.to_string(), Vec::new());
        Ok(())
    }

    pub fn add(&mut self, name: &str, member: &str) -> Result<()> {
        let members = self
            .groups
            .get_mut(name)
            .ok_or_else(|| Error::Mail(format!("no group named '{name}'")))?;
        if !members.iter().any(|m| m == member) {
            members.push(member.to_string());
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &str, member: &str) -> Result<()> {
        let members = self
            .groups
            .get_mut(name)
            .ok_or_else(|| Error::Mail(format!("no group named '{name}'")))?;
        members.retain(|m| m != member);
        Ok(())
    }

    pub fn members(&self, name: &str) -> Option<&[String]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.groups.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_crud_roundtrip() {
        let temp = TempDir::new().unwrap();
        let home = OverstoryHome::at(temp.path());
        std::fs::create_dir_all(home.dir()).unwrap();

        let mut groups = Groups::load(&home);
        groups.create("storage-team").unwrap();
        groups.add("storage-team", "alice").unwrap();
        groups.add("storage-team", "bob").unwrap();
        groups.add("storage-team", "alice").unwrap(); // dedup
        groups.save(&home).unwrap();

        let reloaded = Groups::load(&home);
        assert_eq!(
            reloaded.members("storage-team").unwrap(),
            &["alice".to_string(), "bob".to_string()]
        );

        let mut groups = reloaded;
        groups.remove("storage-team", "alice").unwrap();
        assert_eq!(groups.members("storage-team").unwrap(), &["bob".to_string()]);
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let temp = TempDir::new().unwrap();
        let home = OverstoryHome::at(temp.path());
        let mut groups = Groups::load(&home);
        groups.create("x").unwrap();
        assert!(groups.create("x").is_err());
    }

    #[test]
    fn test_unknown_group_errors() {
        let temp = TempDir::new().unwrap();
        let home = OverstoryHome::at(temp.path());
        let mut groups = Groups::load(&home);
        assert!(groups.add("ghost", "alice").is_err());
        assert!(groups.remove("ghost", "alice").is_err());
        assert!(groups.members("ghost").is_none());
    }
}
