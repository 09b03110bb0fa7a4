//! Configuration management for Autogit
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (AUTOGIT_*)
//! 3. Config file (~/.config/autogit/config.toml)
//! 4. Default values

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lease::DEFAULT_WORK_TIME_LIMIT;
use crate::{Error, Result};

/// Default number of sync workers
pub const DEFAULT_WORKERS: usize = 4;

/// Manager-related configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Number of parallel sync workers
    pub workers: usize,

    /// How long a working marker keeps other processes away
    #[serde(with = "humantime_serde")]
    pub work_time_limit: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            work_time_limit: DEFAULT_WORK_TIME_LIMIT,
        }
    }
}

/// Shared store configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root of the shared store; defaults to `<data_dir>/autogit/store`
    pub root: Option<PathBuf>,

    /// Where job workspaces are created; defaults to the system temp dir
    pub scratch_dir: Option<PathBuf>,
}

impl StoreConfig {
    /// The configured root, or the default location
    pub fn root_or_default(&self) -> Result<PathBuf> {
        if let Some(root) = &self.root {
            return Ok(root.clone());
        }
        dirs::data_dir()
            .map(|p| p.join("autogit").join("store"))
            .ok_or_else(|| Error::Config("Could not determine a data directory".to_string()))
    }
}

/// Clock configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Known offset of the local clock from the shared reference, in seconds
    /// (local minus reference). Unset means unknown.
    pub offset_secs: Option<i64>,
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Manager configuration
    pub manager: ManagerConfig,

    /// Store configuration
    pub store: StoreConfig,

    /// Clock configuration
    pub clock: ClockConfig,
}

impl Config {
    /// Load configuration from the default config file location
    ///
    /// Returns default config if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();

        if let Some(path) = config_path {
            if path.exists() {
                return Self::load_from_file(&path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(Error::Io)?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Get the default config file path
    ///
    /// Returns `~/.config/autogit/config.toml` on Unix
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("autogit").join("config.toml"))
    }

    /// Apply environment variable overrides
    ///
    /// Supported variables:
    /// - AUTOGIT_WORKERS: Number of sync workers
    /// - AUTOGIT_WORK_TIME_LIMIT: Lease time limit (e.g. "30m")
    /// - AUTOGIT_STORE_ROOT: Root of the shared store
    /// - AUTOGIT_SCRATCH_DIR: Where job workspaces are created
    /// - AUTOGIT_CLOCK_OFFSET: Local clock offset in signed seconds
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(workers) = lookup("AUTOGIT_WORKERS") {
            self.manager.workers = workers
                .parse()
                .map_err(|e| Error::Config(format!("Invalid AUTOGIT_WORKERS: {}", e)))?;
        }

        if let Some(limit) = lookup("AUTOGIT_WORK_TIME_LIMIT") {
            self.manager.work_time_limit = humantime_serde::re::humantime::parse_duration(&limit)
                .map_err(|e| Error::Config(format!("Invalid AUTOGIT_WORK_TIME_LIMIT: {}", e)))?;
        }

        if let Some(root) = lookup("AUTOGIT_STORE_ROOT") {
            self.store.root = Some(PathBuf::from(root));
        }

        if let Some(scratch) = lookup("AUTOGIT_SCRATCH_DIR") {
            self.store.scratch_dir = Some(PathBuf::from(scratch));
        }

        if let Some(offset) = lookup("AUTOGIT_CLOCK_OFFSET") {
            self.clock.offset_secs = Some(
                offset
                    .parse()
                    .map_err(|e| Error::Config(format!("Invalid AUTOGIT_CLOCK_OFFSET: {}", e)))?,
            );
        }

        Ok(self)
    }

    /// Apply CLI flag overrides
    pub fn with_cli_overrides(mut self, workers: Option<usize>, store_root: Option<PathBuf>) -> Self {
        if let Some(workers) = workers {
            self.manager.workers = workers;
        }

        if let Some(root) = store_root {
            self.store.root = Some(root);
        }

        self
    }

    /// Reject values the manager cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.manager.workers == 0 {
            return Err(Error::Config("manager.workers must be at least 1".to_string()));
        }
        if self.manager.work_time_limit.is_zero() {
            return Err(Error::Config(
                "manager.work_time_limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration with all overrides applied
    ///
    /// Priority: CLI > env > config file > defaults
    pub fn load_with_overrides(workers: Option<usize>, store_root: Option<PathBuf>) -> Result<Self> {
        let config = Self::load()?
            .with_env_overrides()?
            .with_cli_overrides(workers, store_root);
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.manager.workers, 4);
        assert_eq!(config.manager.work_time_limit, Duration::from_secs(3600));
        assert!(config.store.root.is_none());
        assert!(config.clock.offset_secs.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[manager]
workers = 8
work_time_limit = "30m"

[store]
root = "/srv/autogit"

[clock]
offset_secs = -3
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.manager.workers, 8);
        assert_eq!(config.manager.work_time_limit, Duration::from_secs(30 * 60));
        assert_eq!(config.store.root, Some(PathBuf::from("/srv/autogit")));
        assert_eq!(config.clock.offset_secs, Some(-3));
    }

    #[test]
    fn test_partial_toml() {
        let toml = r#"
[manager]
workers = 2
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.manager.workers, 2);
        // work_time_limit should use default
        assert_eq!(config.manager.work_time_limit, DEFAULT_WORK_TIME_LIMIT);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::default()
            .with_overrides_from(env(&[
                ("AUTOGIT_WORKERS", "2"),
                ("AUTOGIT_WORK_TIME_LIMIT", "90s"),
                ("AUTOGIT_STORE_ROOT", "/tmp/store"),
                ("AUTOGIT_CLOCK_OFFSET", "12"),
            ]))
            .unwrap();

        assert_eq!(config.manager.workers, 2);
        assert_eq!(config.manager.work_time_limit, Duration::from_secs(90));
        assert_eq!(config.store.root, Some(PathBuf::from("/tmp/store")));
        assert_eq!(config.clock.offset_secs, Some(12));
    }

    #[test]
    fn test_invalid_env_is_config_error() {
        let err = Config::default()
            .with_overrides_from(env(&[("AUTOGIT_WORKERS", "many")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_cli_overrides_env() {
        let config = Config::default()
            .with_overrides_from(env(&[("AUTOGIT_WORKERS", "2")]))
            .unwrap()
            .with_cli_overrides(Some(6), Some(PathBuf::from("/cli/store")));

        assert_eq!(config.manager.workers, 6);
        assert_eq!(config.store.root, Some(PathBuf::from("/cli/store")));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = Config::default().with_cli_overrides(Some(0), None);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[manager]\nworkers = 3\n").unwrap();
        assert_eq!(Config::load_from_file(&path).unwrap().manager.workers, 3);

        std::fs::write(&path, "[manager\n").unwrap();
        assert!(matches!(Config::load_from_file(&path), Err(Error::Config(_))));
    }
}
