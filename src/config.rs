//! Engine configuration file (`maintkit.json`).
//!
//! Everything here is optional. Without a file the engine writes logs to
//! `logs/` next to the executable and performs the elevation check.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::log_store::LogStore;

/// Settings read from `maintkit.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Directory holding the log records. Relative paths are resolved
    /// against the directory containing the config file.
    pub log_dir: Option<PathBuf>,

    /// Start operations without checking for administrator rights
    pub skip_elevation_check: bool,
}

impl EngineConfig {
    pub const FILE_NAME: &'static str = "maintkit.json";

    /// `maintkit.json` next to the running executable
    pub fn default_path() -> Option<PathBuf> {
        let exe = std::env::current_exe().ok()?;
        Some(exe.parent()?.join(Self::FILE_NAME))
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration from {:?}", path))?;
        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse configuration JSON in {:?}", path))?;
        config.validate()?;

        if let Some(dir) = config.log_dir.take() {
            let resolved = match path.parent() {
                Some(base) if dir.is_relative() => base.join(dir),
                _ => dir,
            };
            config.log_dir = Some(resolved);
        }
        Ok(config)
    }

    /// Load `explicit` if given (it must exist), otherwise the default file
    /// if present, otherwise defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => {
                tracing::debug!(path = %path.display(), "Loading configuration");
                Self::load_from_file(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(dir) = &self.log_dir {
            if dir.as_os_str().is_empty() {
                anyhow::bail!("log_dir must not be empty");
            }
        }
        Ok(())
    }

    /// Log directory to use: command-line override, then config, then default.
    pub fn resolve_log_dir(&self, cli_override: Option<&Path>) -> Result<PathBuf> {
        if let Some(dir) = cli_override {
            return Ok(dir.to_path_buf());
        }
        if let Some(dir) = &self.log_dir {
            return Ok(dir.clone());
        }
        LogStore::default_dir().context("Failed to locate the executable directory for logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.log_dir.is_none());
        assert!(!config.skip_elevation_check);
        assert!(config.validate().is_ok());
    }

    fn save_to_file(config: &EngineConfig, path: &Path) {
        let json = serde_json::to_string_pretty(config).expect("serialize");
        fs::write(path, json).expect("write");
    }

    #[test]
    fn test_save_and_load_json_config() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join(EngineConfig::FILE_NAME);
        let config = EngineConfig {
            log_dir: Some(dir.path().join("logs")),
            skip_elevation_check: true,
        };

        save_to_file(&config, &path);
        let loaded = EngineConfig::load_from_file(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_relative_log_dir_resolves_against_config_dir() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("maintkit.json");
        fs::write(&path, r#"{ "log_dir": "records" }"#).expect("write");

        let loaded = EngineConfig::load_from_file(&path).expect("load");
        assert_eq!(loaded.log_dir, Some(dir.path().join("records")));
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("maintkit.json");
        fs::write(&path, "{}").expect("write");

        let loaded = EngineConfig::load_from_file(&path).expect("load");
        assert_eq!(loaded, EngineConfig::default());
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("maintkit.json");
        fs::write(&path, r#"{ "log_directory": "x" }"#).expect("write");

        assert!(EngineConfig::load_from_file(&path).is_err());
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("maintkit.json");
        fs::write(&path, "{ not json").expect("write");

        let err = EngineConfig::load_from_file(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse configuration JSON"));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = TempDir::new().expect("tempdir");
        let missing = dir.path().join("nope.json");
        assert!(EngineConfig::load_or_default(Some(&missing)).is_err());
    }

    #[test]
    fn test_empty_log_dir_is_rejected() {
        let config = EngineConfig {
            log_dir: Some(PathBuf::new()),
            skip_elevation_check: false,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_log_dir_precedence() {
        let config = EngineConfig {
            log_dir: Some(PathBuf::from("/from/config")),
            skip_elevation_check: false,
        };
        assert_eq!(
            config.resolve_log_dir(Some(Path::new("/from/cli"))).unwrap(),
            PathBuf::from("/from/cli")
        );
        assert_eq!(config.resolve_log_dir(None).unwrap(), PathBuf::from("/from/config"));
        assert!(EngineConfig::default().resolve_log_dir(None).is_ok());
    }
}
