//! Configuration loading and validation.
//!
//! Resolution order (highest to lowest priority):
//! 1. Explicit CLI flags (applied by the caller on top of the result)
//! 2. Environment variables (`VW_HOST_INTERVAL_MS`, `VW_INSTANCE_INTERVAL_MS`,
//!    `VW_USER`, `VW_TEMP_ROOTS`)
//! 3. Config file (`--config`, else `$XDG_CONFIG_HOME/vmwatch/config.toml`)
//! 4. Built-in defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::monitor::EmptyScanPolicy;

/// Default XDG config directory name.
const CONFIG_DIR_NAME: &str = "vmwatch";
const CONFIG_FILE_NAME: &str = "config.toml";

pub const ENV_HOST_INTERVAL_MS: &str = "VW_HOST_INTERVAL_MS";
pub const ENV_INSTANCE_INTERVAL_MS: &str = "VW_INSTANCE_INTERVAL_MS";
pub const ENV_USER: &str = "VW_USER";
pub const ENV_TEMP_ROOTS: &str = "VW_TEMP_ROOTS";

/// Errors that can occur during config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Invalid TOML in config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for vw_common::Error {
    fn from(err: ConfigError) -> Self {
        vw_common::Error::Config(err.to_string())
    }
}

/// Monitor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Host scan period.
    pub host_interval_ms: u64,
    /// Per-instance sample period.
    pub instance_interval_ms: u64,
    /// Only consider instances owned by this user.
    pub user: Option<String>,
    /// Replaces the default temp directory roots when non-empty.
    pub temp_roots: Vec<PathBuf>,
    pub empty_scan: EmptyScanPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            host_interval_ms: 1000,
            instance_interval_ms: 1000,
            user: None,
            temp_roots: Vec::new(),
            empty_scan: EmptyScanPolicy::Ignore,
        }
    }
}

impl MonitorConfig {
    pub fn host_interval(&self) -> Duration {
        Duration::from_millis(self.host_interval_ms)
    }

    pub fn instance_interval(&self) -> Duration {
        Duration::from_millis(self.instance_interval_ms)
    }

    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ConfigError::Io {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_HOST_INTERVAL_MS) {
            self.host_interval_ms = parse_millis(ENV_HOST_INTERVAL_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_INSTANCE_INTERVAL_MS) {
            self.instance_interval_ms = parse_millis(ENV_INSTANCE_INTERVAL_MS, &value)?;
        }
        if let Some(user) = lookup(ENV_USER) {
            let user = user.trim();
            self.user = if user.is_empty() {
                None
            } else {
                Some(user.to_string())
            };
        }
        if let Some(roots) = lookup(ENV_TEMP_ROOTS) {
            self.temp_roots = std::env::split_paths(&roots)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }
        Ok(())
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "host_interval_ms must be positive".to_string(),
            ));
        }
        if self.instance_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "instance_interval_ms must be positive".to_string(),
            ));
        }
        if let Some(root) = self.temp_roots.iter().find(|r| !r.is_absolute()) {
            return Err(ConfigError::Invalid(format!(
                "temp root {} is not absolute",
                root.display()
            )));
        }
        Ok(())
    }
}

fn parse_millis(var: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(format!("{}={} is not a number of milliseconds", var, value)))
}

/// Configuration resolution options.
#[derive(Debug, Default, Clone)]
pub struct ConfigOptions {
    /// Explicit config file; must exist when set.
    pub config_path: Option<PathBuf>,
}

/// Resolved configuration with provenance.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: MonitorConfig,
    /// File the settings were read from (None if using defaults).
    pub path: Option<PathBuf>,
}

/// `$XDG_CONFIG_HOME/vmwatch/config.toml`, or the platform equivalent.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Load configuration with the standard resolution order.
pub fn load_config(options: &ConfigOptions) -> Result<ResolvedConfig, ConfigError> {
    load_config_with(options, default_config_path(), |key| std::env::var(key).ok())
}

/// [`load_config`] with an injectable default path and environment.
pub fn load_config_with<F>(
    options: &ConfigOptions,
    default_path: Option<PathBuf>,
    lookup: F,
) -> Result<ResolvedConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let (mut config, path) = match &options.config_path {
        Some(path) => (MonitorConfig::from_file(path)?, Some(path.clone())),
        None => match default_path.filter(|p| p.exists()) {
            Some(path) => (MonitorConfig::from_file(&path)?, Some(path)),
            None => (MonitorConfig::default(), None),
        },
    };
    config.apply_env(lookup)?;
    config.validate()?;
    Ok(ResolvedConfig { config, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_file() {
        let resolved = load_config_with(&ConfigOptions::default(), None, env(&[])).unwrap();
        assert_eq!(resolved.config, MonitorConfig::default());
        assert!(resolved.path.is_none());
        assert_eq!(resolved.config.host_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_file_then_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "host_interval_ms = 250\nuser = \"alice\"\nempty_scan = \"report\"\n",
        )
        .unwrap();

        let resolved = load_config_with(
            &ConfigOptions::default(),
            Some(path.clone()),
            env(&[(ENV_HOST_INTERVAL_MS, "500"), (ENV_TEMP_ROOTS, "/a:/b")]),
        )
        .unwrap();
        assert_eq!(resolved.path, Some(path));
        assert_eq!(resolved.config.host_interval_ms, 500);
        assert_eq!(resolved.config.instance_interval_ms, 1000);
        assert_eq!(resolved.config.user.as_deref(), Some("alice"));
        assert_eq!(resolved.config.empty_scan, EmptyScanPolicy::Report);
        assert_eq!(
            resolved.config.temp_roots,
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let options = ConfigOptions {
            config_path: Some(PathBuf::from("/nonexistent/vmwatch.toml")),
        };
        let err = load_config_with(&options, None, env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "host_interval_ms = \"soon\"\n").unwrap();
        let options = ConfigOptions {
            config_path: Some(path),
        };
        let err = load_config_with(&options, None, env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = MonitorConfig::from_toml_str("poll_everything = true", Path::new("x.toml"));
        assert!(err.is_err());
    }

    #[test]
    fn test_zero_interval_invalid() {
        let err = load_config_with(
            &ConfigOptions::default(),
            None,
            env(&[(ENV_INSTANCE_INTERVAL_MS, "0")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_bad_env_number_invalid() {
        let err = load_config_with(
            &ConfigOptions::default(),
            None,
            env(&[(ENV_HOST_INTERVAL_MS, "fast")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains(ENV_HOST_INTERVAL_MS));
    }

    #[test]
    fn test_relative_temp_root_invalid() {
        let config = MonitorConfig {
            temp_roots: vec![PathBuf::from("tmp")],
            ..MonitorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_user_clears_filter() {
        let mut config = MonitorConfig {
            user: Some("alice".into()),
            ..MonitorConfig::default()
        };
        config.apply_env(env(&[(ENV_USER, "")])).unwrap();
        assert!(config.user.is_none());
    }
}
