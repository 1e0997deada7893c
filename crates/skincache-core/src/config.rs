//! Runtime configuration.
//!
//! Resolution order: built-in defaults, then an optional TOML file, then
//! `SKINCACHE_*` environment variables. Every filesystem location is derived
//! from `data-root` and made absolute once, up front.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SkinCacheError};

pub const DEFAULT_VERSIONS_URL: &str = "https://ddragon.leagueoflegends.com/api/versions.json";
pub const DEFAULT_CATALOG_DATA_URL: &str = "https://ddragon.leagueoflegends.com/cdn";
pub const DEFAULT_MIRROR_ROOT: &str = "https://raw.communitydragon.org";
pub const DEFAULT_EXISTENCE_ROOT: &str =
    "https://raw.githubusercontent.com/darkseal-org/lol-skins/main";

/// Listing entries containing any of these are never champion directories.
pub const DEFAULT_DENYLIST: &[&str] = &[
    "tft/",
    "teamfighttactics",
    "teamfight_tactics",
    "tft",
    "tutorial",
    "https",
    "test",
    "strawberry",
    "sru",
    "slime",
    "poro",
    "pet",
    "perk",
    "ultbook",
    "nexus",
    "urf",
    "turret",
    "srx",
    "sr_infernal",
    "spellbook",
    "sonadjg",
    "npc",
    "ha_ap_",
    "durian",
    "crepe",
    "cherry_",
    "bw_",
];

/// An external tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ToolConfig {
    /// Executable path or name on PATH.
    pub program: PathBuf,
    /// Optional launcher the program is run through (e.g. `wine`).
    #[serde(default)]
    pub wrapper: Option<String>,
    /// Deadline for a single invocation.
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_tool_timeout_secs() -> u64 {
    60
}

impl ToolConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            wrapper: None,
            timeout_secs: default_tool_timeout_secs(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// skincache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SkinCacheConfig {
    /// Root for ledger, catalog, staging, output trees and archives.
    pub data_root: PathBuf,
    /// JSON array of raw versions, newest first.
    pub versions_url: String,
    /// Base URL of the per-version champion data documents used for seeding.
    pub catalog_data_url: String,
    /// Root of the content mirror.
    pub mirror_root: String,
    /// Root of the published-packages repository used by existence checks.
    pub existence_root: String,
    /// Use this version instead of asking the version endpoint.
    pub pinned_version: Option<String>,
    /// Listing entries containing any of these substrings are ignored.
    pub denylist: Vec<String>,
    pub transcoder: ToolConfig,
    pub archiver: ToolConfig,
    /// Copied into each package as `META/info.json` when set.
    pub info_template: Option<PathBuf>,
    /// Max pairs per entity per run; 0 drains every stale pair.
    pub per_entity_cap: usize,
    /// Concurrent pairs within one entity (clamped to 1..=8).
    pub workers: usize,
    /// Daemon trigger interval.
    pub interval_secs: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SkinCacheConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("skincache-data"),
            versions_url: DEFAULT_VERSIONS_URL.to_string(),
            catalog_data_url: DEFAULT_CATALOG_DATA_URL.to_string(),
            mirror_root: DEFAULT_MIRROR_ROOT.to_string(),
            existence_root: DEFAULT_EXISTENCE_ROOT.to_string(),
            pinned_version: None,
            denylist: DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect(),
            transcoder: ToolConfig::new("ritobin"),
            archiver: ToolConfig::new("wad-make"),
            info_template: None,
            per_entity_cap: 10,
            workers: 2,
            interval_secs: 3600,
            http_timeout_secs: 30,
            user_agent: format!("skincache/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl SkinCacheConfig {
    /// Load defaults, then `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.absolutize()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SkinCacheError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
            .map_err(|e| SkinCacheError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| SkinCacheError::Config(e.to_string()))
    }

    /// Apply `SKINCACHE_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SKINCACHE_DATA_ROOT") {
            self.data_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("SKINCACHE_VERSIONS_URL") {
            self.versions_url = v;
        }
        if let Some(v) = lookup("SKINCACHE_MIRROR_ROOT") {
            self.mirror_root = v;
        }
        if let Some(v) = lookup("SKINCACHE_PINNED_VERSION") {
            self.pinned_version = Some(v).filter(|v| !v.is_empty());
        }
        if let Some(v) = lookup("SKINCACHE_TRANSCODER") {
            self.transcoder.program = PathBuf::from(v);
        }
        if let Some(v) = lookup("SKINCACHE_ARCHIVER") {
            self.archiver.program = PathBuf::from(v);
        }
        if let Some(v) = lookup("SKINCACHE_TOOL_WRAPPER") {
            let wrapper = Some(v).filter(|v| !v.is_empty());
            self.transcoder.wrapper = wrapper.clone();
            self.archiver.wrapper = wrapper;
        }
        if let Some(v) = lookup("SKINCACHE_PER_ENTITY_CAP") {
            self.per_entity_cap = parse_number("SKINCACHE_PER_ENTITY_CAP", &v)?;
        }
        if let Some(v) = lookup("SKINCACHE_WORKERS") {
            self.workers = parse_number("SKINCACHE_WORKERS", &v)?;
        }
        if let Some(v) = lookup("SKINCACHE_INTERVAL_SECS") {
            self.interval_secs = parse_number("SKINCACHE_INTERVAL_SECS", &v)?;
        }
        Ok(())
    }

    fn absolutize(&mut self) -> Result<()> {
        if self.data_root.is_relative() {
            self.data_root = std::env::current_dir()?.join(&self.data_root);
        }
        Ok(())
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_root.join("ledger.bin")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_root.join("catalog.json")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_root.join("staging")
    }

    pub fn on_demand_staging_dir(&self) -> PathBuf {
        self.data_root.join("staging-on-demand")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.data_root.join("output")
    }

    pub fn package_dir(&self) -> PathBuf {
        self.data_root.join("cdn")
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Shared HTTP client for every upstream request.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .timeout(self.http_timeout())
            .build()
            .map_err(|e| SkinCacheError::Config(format!("http client: {e}")))
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SkinCacheError::Config(format!("{key} must be a number, got {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = SkinCacheConfig::default();
        assert_eq!(config.per_entity_cap, 10);
        assert_eq!(config.workers, 2);
        assert_eq!(config.transcoder.timeout_secs, 60);
        assert!(config.denylist.iter().any(|d| d == "tft"));
        assert!(config.ledger_path().ends_with("ledger.bin"));
    }

    #[test]
    fn test_toml_partial_override() {
        let config = SkinCacheConfig::from_toml_str(
            r#"
            data-root = "/srv/skins"
            per-entity-cap = 0
            pinned-version = "14.3"

            [transcoder]
            program = "/opt/tools/ritobin.exe"
            wrapper = "wine"
            timeout-secs = 90

            [archiver]
            program = "/opt/tools/wad-make.exe"
            timeout-secs = 120
            "#,
        )
        .unwrap();

        assert_eq!(config.data_root, PathBuf::from("/srv/skins"));
        assert_eq!(config.per_entity_cap, 0);
        assert_eq!(config.pinned_version.as_deref(), Some("14.3"));
        assert_eq!(config.transcoder.wrapper.as_deref(), Some("wine"));
        assert_eq!(config.transcoder.timeout(), Duration::from_secs(90));
        assert!(config.archiver.wrapper.is_none());
        // Untouched fields keep their defaults.
        assert_eq!(config.workers, 2);
        assert_eq!(config.mirror_root, DEFAULT_MIRROR_ROOT);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = SkinCacheConfig::from_toml_str("per-entity-cap = \"lots\"").unwrap_err();
        assert!(matches!(err, SkinCacheError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SKINCACHE_DATA_ROOT", "/var/lib/skincache"),
            ("SKINCACHE_TOOL_WRAPPER", "wine"),
            ("SKINCACHE_WORKERS", "4"),
            ("SKINCACHE_PINNED_VERSION", ""),
        ]
        .into_iter()
        .collect();

        let mut config = SkinCacheConfig {
            pinned_version: Some("13.1".to_string()),
            ..SkinCacheConfig::default()
        };
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.data_root, PathBuf::from("/var/lib/skincache"));
        assert_eq!(config.workers, 4);
        assert_eq!(config.archiver.wrapper.as_deref(), Some("wine"));
        assert!(config.pinned_version.is_none());
    }

    #[test]
    fn test_env_rejects_non_numeric() {
        let mut config = SkinCacheConfig::default();
        let err = config
            .apply_env(|key| (key == "SKINCACHE_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("SKINCACHE_WORKERS"));
    }

    #[test]
    fn test_derived_paths_share_root() {
        let config = SkinCacheConfig {
            data_root: PathBuf::from("/data"),
            ..SkinCacheConfig::default()
        };
        assert_eq!(config.staging_dir(), PathBuf::from("/data/staging"));
        assert_eq!(config.package_dir(), PathBuf::from("/data/cdn"));
        assert_eq!(config.catalog_path(), PathBuf::from("/data/catalog.json"));
    }
}
