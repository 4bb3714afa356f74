use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::uninstall::job::UninstallMode;

/// Global fspurge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Mode used when the caller does not pick one
    #[serde(default = "default_mode")]
    pub default_mode: UninstallMode,

    /// Seal a snapshot before removing anything
    #[serde(default = "default_true")]
    pub backup_enabled: bool,

    /// Snapshots older than this are purged by `purge --expired`
    #[serde(default = "default_retention_days")]
    pub snapshot_retention_days: u32,

    /// Attempts per entry before a busy file is reported as locked
    #[serde(default = "default_removal_retries")]
    pub removal_retries: u32,

    /// Extra glob rules that are always protected
    #[serde(default)]
    pub extra_protections: Vec<String>,

    /// Glob rules exempt from built-in protection (only honored when
    /// `allow_protection_overrides` is set)
    #[serde(default)]
    pub protection_overrides: Vec<String>,

    #[serde(default)]
    pub allow_protection_overrides: bool,

    /// Confidence thresholds per mode
    #[serde(default)]
    pub thresholds: Thresholds,

    #[serde(default)]
    pub scan: ScanSettings,

    #[serde(default)]
    pub termination: TerminationSettings,

    /// Directory names the locator never descends into, grouped by category
    #[serde(default = "default_excluded_locations")]
    pub excluded_locations: BTreeMap<String, ExcludedLocation>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    pub quick: f64,
    pub standard: f64,
    pub force: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            quick: 0.9,
            standard: 0.6,
            force: 0.4,
        }
    }
}

impl Thresholds {
    pub fn for_mode(&self, mode: UninstallMode) -> f64 {
        match mode {
            UninstallMode::Quick => self.quick,
            UninstallMode::Standard => self.standard,
            UninstallMode::Force => self.force,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Maximum depth below each container root
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    #[serde(default = "default_true")]
    pub use_cache: bool,

    /// Cached results older than this are rescanned even if the
    /// fingerprint still matches
    #[serde(default = "default_cache_max_age_hours")]
    pub cache_max_age_hours: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            use_cache: true,
            cache_max_age_hours: default_cache_max_age_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminationSettings {
    #[serde(default = "default_standard_timeout")]
    pub standard_timeout_secs: u64,

    #[serde(default = "default_force_timeout")]
    pub force_timeout_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for TerminationSettings {
    fn default() -> Self {
        Self {
            standard_timeout_secs: default_standard_timeout(),
            force_timeout_secs: default_force_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl TerminationSettings {
    pub fn standard_timeout(&self) -> Duration {
        Duration::from_secs(self.standard_timeout_secs)
    }

    pub fn force_timeout(&self) -> Duration {
        Duration::from_secs(self.force_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExcludedLocation {
    pub enabled: bool,
    pub paths: Vec<String>,
}

fn default_mode() -> UninstallMode {
    UninstallMode::Standard
}
fn default_true() -> bool {
    true
}
fn default_retention_days() -> u32 {
    30
}
fn default_removal_retries() -> u32 {
    3
}
fn default_max_depth() -> usize {
    4
}
fn default_cache_max_age_hours() -> u64 {
    24
}
fn default_standard_timeout() -> u64 {
    10
}
fn default_force_timeout() -> u64 {
    3
}
fn default_poll_interval() -> u64 {
    100
}

fn default_excluded_locations() -> BTreeMap<String, ExcludedLocation> {
    let group = |paths: &[&str]| ExcludedLocation {
        enabled: true,
        paths: paths.iter().map(|p| p.to_string()).collect(),
    };

    let mut map = BTreeMap::new();
    map.insert(
        "development".to_string(),
        group(&[
            "site-packages",
            "node_modules",
            "venv",
            ".virtualenv",
            "pip",
            "npm",
            "yarn",
            "composer",
            "gradle",
            "maven",
        ]),
    );
    map.insert(
        "plugins_extensions".to_string(),
        group(&["plugins", "extensions", "addons", "plug-ins"]),
    );
    map.insert("system".to_string(), group(&["System", "Private"]));
    map.insert("custom".to_string(), group(&[]));
    map
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_mode: default_mode(),
            backup_enabled: true,
            snapshot_retention_days: default_retention_days(),
            thresholds: Thresholds::default(),
            scan: ScanSettings::default(),
            termination: TerminationSettings::default(),
            removal_retries: default_removal_retries(),
            excluded_locations: default_excluded_locations(),
            extra_protections: Vec::new(),
            protection_overrides: Vec::new(),
            allow_protection_overrides: false,
        }
    }
}

impl Config {
    /// Get the fspurge data directory (`$FSPURGE_HOME` or ~/.fspurge)
    pub fn data_dir() -> PathBuf {
        if let Some(dir) = std::env::var_os("FSPURGE_HOME") {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".fspurge")
    }

    pub fn config_path() -> PathBuf {
        Self::data_dir().join("config.toml")
    }

    /// Load config from the default location, or defaults if absent
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config: {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Thresholds must lie in [0, 1] and keep quick as the most
    /// conservative mode.
    pub fn validate(&self) -> Result<()> {
        let t = &self.thresholds;
        for (name, value) in [("quick", t.quick), ("standard", t.standard), ("force", t.force)] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("threshold '{}' must be within [0, 1], got {}", name, value);
            }
        }
        if !(t.quick >= t.standard && t.standard >= t.force) {
            anyhow::bail!(
                "thresholds must satisfy quick >= standard >= force (got {} / {} / {})",
                t.quick,
                t.standard,
                t.force
            );
        }
        if self.removal_retries == 0 {
            anyhow::bail!("removal_retries must be at least 1");
        }
        Ok(())
    }

    /// Directory names from every enabled exclusion group
    pub fn excluded_dir_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .excluded_locations
            .values()
            .filter(|group| group.enabled)
            .flat_map(|group| group.paths.iter().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}
