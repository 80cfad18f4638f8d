//! Configuration loading.
//!
//! Merge order: built-in defaults ← `config.yaml` ← `config.local.yaml`,
//! both read from `{project_root}/.overstory/`. Keys are camelCase in YAML.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::paths::OverstoryHome;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub project: ProjectConfig,
    pub agents: AgentsConfig,
    pub worktrees: WorktreesConfig,
    pub beads: BeadsConfig,
    pub mulch: MulchConfig,
    pub merge: MergeConfig,
    pub providers: HashMap<String, ProviderConfig>,
    pub watchdog: WatchdogConfig,
    /// Capability role → model alias (`sonnet`, `opus`, `haiku`).
    pub models: HashMap<String, String>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectConfig {
    pub name: String,
    pub root: Option<PathBuf>,
    pub canonical_branch: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            root: None,
            canonical_branch: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    pub manifest_path: Option<PathBuf>,
    pub base_dir: Option<PathBuf>,
    pub max_concurrent: usize,
    pub stagger_delay_ms: u64,
    pub max_depth: u32,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            manifest_path: None,
            base_dir: None,
            max_concurrent: 25,
            stagger_delay_ms: 2000,
            max_depth: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorktreesConfig {
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BeadsConfig {
    pub enabled: bool,
}

impl Default for BeadsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Prime packet rendering format for the knowledge store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimeFormat {
    #[default]
    Markdown,
    Xml,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MulchConfig {
    pub enabled: bool,
    pub domains: Vec<String>,
    pub prime_format: PrimeFormat,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MergeConfig {
    pub ai_resolve_enabled: bool,
    pub reimagine_enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    #[default]
    Native,
    Gateway,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    pub base_url: Option<String>,
    pub auth_token_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchdogConfig {
    pub tier0_enabled: bool,
    pub tier0_interval_ms: u64,
    pub tier1_enabled: bool,
    pub tier2_enabled: bool,
    /// `working` → `stalled` after this much inactivity.
    pub stale_threshold_ms: u64,
    /// `stalled` → kill + `zombie` after this much stall time.
    pub zombie_threshold_ms: u64,
    pub nudge_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tier0_enabled: true,
            tier0_interval_ms: 30_000,
            tier1_enabled: false,
            tier2_enabled: false,
            stale_threshold_ms: 300_000,
            zombie_threshold_ms: 600_000,
            nudge_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub verbose: bool,
    pub redact_secrets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            redact_secrets: true,
        }
    }
}

impl Config {
    /// Load and merge configuration for a resolved overstory home.
    pub fn load(home: &OverstoryHome) -> Result<Self> {
        let mut value = serde_yaml::to_value(Config::default())
            .map_err(|e| Error::Config(format!("cannot serialize defaults: {e}")))?;

        for path in [home.config_file(), home.local_config_file()] {
            if let Some(overlay) = read_yaml(&path)? {
                let overlay = migrate_legacy_watchdog_keys(overlay, &path);
                merge_value(&mut value, overlay);
            }
        }

        let mut config: Config = serde_yaml::from_value(value)
            .map_err(|e| Error::Config(format!("invalid configuration: {e}")))?;

        if config.project.root.is_none() {
            config.project.root = Some(home.root().to_path_buf());
        }
        if config.project.name.is_empty() {
            config.project.name = home
                .root()
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "project".to_string());
        }

        config.validate()?;
        Ok(config)
    }

    /// Invariants checked at load time.
    pub fn validate(&self) -> Result<()> {
        if self.watchdog.zombie_threshold_ms <= self.watchdog.stale_threshold_ms {
            return Err(Error::Config(format!(
                "watchdog.zombieThresholdMs ({}) must be greater than staleThresholdMs ({})",
                self.watchdog.zombie_threshold_ms, self.watchdog.stale_threshold_ms
            )));
        }
        if self.agents.max_concurrent == 0 {
            return Err(Error::Config(
                "agents.maxConcurrent must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Project root; always populated after `load`.
    pub fn project_root(&self) -> PathBuf {
        self.project
            .root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Tmux session name for an agent: `overstory-{project}-{agent}`.
    pub fn tmux_session_name(&self, agent: &str) -> String {
        format!("overstory-{}-{}", self.project.name, agent)
    }

    /// Model alias for a capability role, if configured.
    pub fn model_for(&self, capability: &str) -> Option<&str> {
        self.models.get(capability).map(String::as_str)
    }
}

fn read_yaml(path: &Path) -> Result<Option<serde_yaml::Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let value: serde_yaml::Value = serde_yaml::from_str(&raw)
        .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
    Ok(Some(value))
}

/// Deep-merge `overlay` into `base`. Mappings merge recursively; every other
/// type replaces wholesale.
fn merge_value(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(base_value) => merge_value(base_value, overlay_value),
                    None => {
                        base_map.insert(key, overlay_value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

/// Old configs numbered the mechanical tier `tier1` and AI triage `tier2`.
/// The presence of `tier0Enabled` marks a new-numbering file; without it,
/// shift the legacy keys down one tier and warn.
fn migrate_legacy_watchdog_keys(mut value: serde_yaml::Value, source: &Path) -> serde_yaml::Value {
    let watchdog_key = serde_yaml::Value::from("watchdog");
    let Some(watchdog) = value
        .as_mapping_mut()
        .and_then(|m| m.get_mut(&watchdog_key))
        .and_then(serde_yaml::Value::as_mapping_mut)
    else {
        return value;
    };

    let tier0_key = serde_yaml::Value::from("tier0Enabled");
    let tier1_key = serde_yaml::Value::from("tier1Enabled");
    let tier2_key = serde_yaml::Value::from("tier2Enabled");

    if watchdog.contains_key(&tier0_key) {
        return value;
    }
    if !watchdog.contains_key(&tier1_key) && !watchdog.contains_key(&tier2_key) {
        return value;
    }

    eprintln!(
        "warning: {} uses the legacy watchdog tier numbering; \
         tier1Enabled/tier2Enabled now mean AI triage and persistent monitor \
         (mechanical reconciliation is tier0Enabled)",
        source.display()
    );

    let legacy_tier1 = watchdog.remove(&tier1_key);
    let legacy_tier2 = watchdog.remove(&tier2_key);
    if let Some(v) = legacy_tier1 {
        watchdog.insert(tier0_key, v);
    }
    if let Some(v) = legacy_tier2 {
        watchdog.insert(tier1_key, v);
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn home_with_config(yaml: &str) -> (TempDir, OverstoryHome) {
        let temp = TempDir::new().unwrap();
        let home = OverstoryHome::at(temp.path());
        fs::create_dir_all(home.dir()).unwrap();
        fs::write(home.config_file(), yaml).unwrap();
        (temp, home)
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.project.canonical_branch, "main");
        assert_eq!(config.agents.max_concurrent, 25);
        assert_eq!(config.agents.stagger_delay_ms, 2000);
        assert_eq!(config.agents.max_depth, 2);
        assert!(config.beads.enabled);
        assert_eq!(config.watchdog.tier0_interval_ms, 30_000);
        assert_eq!(config.watchdog.stale_threshold_ms, 300_000);
        assert_eq!(config.watchdog.zombie_threshold_ms, 600_000);
    }

    #[test]
    fn test_load_merges_overrides() {
        let (_temp, home) =
            home_with_config("project:\n  name: demo\nagents:\n  maxConcurrent: 3\n");
        let config = Config::load(&home).unwrap();
        assert_eq!(config.project.name, "demo");
        assert_eq!(config.agents.max_concurrent, 3);
        // untouched keys keep defaults
        assert_eq!(config.agents.max_depth, 2);
    }

    #[test]
    fn test_local_overlay_wins() {
        let (_temp, home) = home_with_config("agents:\n  maxConcurrent: 3\n");
        fs::write(home.local_config_file(), "agents:\n  maxConcurrent: 9\n").unwrap();
        let config = Config::load(&home).unwrap();
        assert_eq!(config.agents.max_concurrent, 9);
    }

    #[test]
    fn test_threshold_invariant_rejected() {
        let (_temp, home) = home_with_config(
            "watchdog:\n  tier0Enabled: true\n  staleThresholdMs: 600000\n  zombieThresholdMs: 600000\n",
        );
        let err = Config::load(&home).unwrap_err();
        assert_eq!(err.kind(), "Config");
        assert!(err.to_string().contains("zombieThresholdMs"));
    }

    #[test]
    fn test_legacy_tier_keys_shift_down() {
        let (_temp, home) =
            home_with_config("watchdog:\n  tier1Enabled: true\n  tier2Enabled: true\n");
        let config = Config::load(&home).unwrap();
        assert!(config.watchdog.tier0_enabled);
        assert!(config.watchdog.tier1_enabled);
        // legacy files never mention the monitor tier
        assert!(!config.watchdog.tier2_enabled);
    }

    #[test]
    fn test_new_numbering_untouched() {
        let (_temp, home) =
            home_with_config("watchdog:\n  tier0Enabled: false\n  tier1Enabled: true\n");
        let config = Config::load(&home).unwrap();
        assert!(!config.watchdog.tier0_enabled);
        assert!(config.watchdog.tier1_enabled);
    }

    #[test]
    fn test_project_name_defaults_to_root_dir() {
        let temp = TempDir::new().unwrap();
        let home = OverstoryHome::at(temp.path());
        fs::create_dir_all(home.dir()).unwrap();
        let config = Config::load(&home).unwrap();
        assert!(!config.project.name.is_empty());
        assert_eq!(config.project.root.as_deref(), Some(temp.path()));
    }

    #[test]
    fn test_tmux_session_name() {
        let mut config = Config::default();
        config.project.name = "demo".to_string();
        assert_eq!(
            config.tmux_session_name("builder-1"),
            "overstory-demo-builder-1"
        );
    }

    #[test]
    fn test_providers_parse() {
        let (_temp, home) = home_with_config(
            "providers:\n  anthropic:\n    type: gateway\n    baseUrl: https://gw.local\n    authTokenEnv: GW_TOKEN\n",
        );
        let config = Config::load(&home).unwrap();
        let provider = config.providers.get("anthropic").unwrap();
        assert_eq!(provider.provider_type, ProviderType::Gateway);
        assert_eq!(provider.base_url.as_deref(), Some("https://gw.local"));
        assert_eq!(provider.auth_token_env.as_deref(), Some("GW_TOKEN"));
    }
}
