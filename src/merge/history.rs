//! Conflict-history intelligence.
//!
//! Past resolver outcomes keyed by file path. A tier that keeps failing on
//! a file is skipped on the next conflict touching it, and previously
//! successful strategies are surfaced to the ai-assist prompt.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::paths::OverstoryHome;
use crate::store::ResolveTier;

/// A tier is skipped for a file once it has failed this many times there.
const SKIP_AFTER_FAILURES: u32 = 2;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FileRecord {
    #[serde(default)]
    failures: HashMap<String, u32>,
    #[serde(default)]
    successes: HashMap<String, u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConflictHistory {
    #[serde(default)]
    files: HashMap<String, FileRecord>,
    #[serde(skip)]
    path: PathBuf,
}

impl ConflictHistory {
    pub fn load(home: &OverstoryHome) -> Self {
        let path = home.merge_history_file();
        let mut history: ConflictHistory = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        history.path = path;
        history
    }

    pub fn save(&self) -> Result<()> {
        let body = serde_json::to_string_pretty(self)?;
        fs::write(&self.path, body)
            .map_err(|e| Error::Merge(format!("cannot write {}: {e}", self.path.display())))?;
        Ok(())
    }

    pub fn record(&mut self, file: &str, tier: ResolveTier, success: bool) {
        let record = self.files.entry(file.to_string()).or_default();
        let bucket = if success {
            &mut record.successes
        } else {
            &mut record.failures
        };
        *bucket.entry(tier.as_str().to_string()).or_insert(0) += 1;
    }

    /// A tier is skipped only when every conflicted file has a losing
    /// track record with it; one unknown file is enough to try.
    pub fn should_skip(&self, files: &[String], tier: ResolveTier) -> bool {
        if files.is_empty() {
            return false;
        }
        files.iter().all(|file| {
            self.files
                .get(file)
                .and_then(|r| r.failures.get(tier.as_str()))
                .is_some_and(|n| *n >= SKIP_AFTER_FAILURES)
        })
    }

    /// Strategy notes for the ai-assist prompt: which tiers worked on
    /// these files before.
    pub fn hints_for(&self, files: &[String]) -> Vec<String> {
        let mut hints = Vec::new();
        for file in files {
            if let Some(record) = self.files.get(file) {
                for (tier, count) in &record.successes {
                    hints.push(format!(
                        "{file}: '{tier}' resolved this file {count} time(s) before"
                    ));
                }
            }
        }
        hints.sort();
        hints
    }
}
