//! Logging configuration.
//!
//! Precedence, highest first:
//! - CLI flags (`--log-level`, `--log-format`, `-v`, `-q`)
//! - `VW_LOG`, `VW_LOG_FORMAT`, `VW_LOG_TIMESTAMPS`
//! - `RUST_LOG` as a full filter directive, consulted only when no level was
//!   chosen above
//! - `info` for the vmwatch crates

use tracing_subscriber::filter::LevelFilter;

pub const ENV_LOG: &str = "VW_LOG";
pub const ENV_LOG_FORMAT: &str = "VW_LOG_FORMAT";
pub const ENV_LOG_TIMESTAMPS: &str = "VW_LOG_TIMESTAMPS";

/// Log output format on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines (default).
    #[default]
    Human,
    /// One JSON object per record, fields flattened.
    Jsonl,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "human" => Ok(LogFormat::Human),
            "jsonl" | "json" => Ok(LogFormat::Jsonl),
            _ => Err(format!("unknown log format: {} (expected human or jsonl)", s)),
        }
    }
}

/// Verbosity of the vmwatch crates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Every scheduler run and poll tick.
    Trace,
    /// Task scheduling, attach paths, ignored empty scans.
    Debug,
    /// Lifecycle messages such as config loaded and watch started.
    Info,
    /// Recoverable problems: failed samples, unreadable roots.
    Warn,
    /// Panicking jobs and listeners.
    Error,
    /// Nothing at all.
    Off,
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "off" => Ok(LogLevel::Off),
            _ => Err(format!("unknown log level: {}", s)),
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Off => LevelFilter::OFF,
        }
    }
}

/// Resolved logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Explicit level. `None` defers to `RUST_LOG`, then `info`.
    pub level: Option<LogLevel>,
    /// Prefix human output with timestamps.
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            format: LogFormat::Human,
            level: None,
            timestamps: true,
        }
    }
}

impl LogConfig {
    /// Resolve from the process environment and CLI overrides.
    pub fn from_env(cli_level: Option<LogLevel>, cli_format: Option<LogFormat>) -> Self {
        Self::from_lookup(|key| std::env::var(key).ok(), cli_level, cli_format)
    }

    /// [`LogConfig::from_env`] with an injectable variable lookup.
    ///
    /// Unparseable `VW_*` values are ignored rather than failing startup.
    pub fn from_lookup<F>(
        lookup: F,
        cli_level: Option<LogLevel>,
        cli_format: Option<LogFormat>,
    ) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_level = lookup(ENV_LOG).and_then(|v| v.parse().ok());
        let env_format = lookup(ENV_LOG_FORMAT).and_then(|v| v.parse().ok());
        let timestamps = lookup(ENV_LOG_TIMESTAMPS)
            .map(|v| !matches!(v.trim(), "0" | "false" | "no"))
            .unwrap_or(true);

        LogConfig {
            format: cli_format.or(env_format).unwrap_or_default(),
            level: cli_level.or(env_level),
            timestamps,
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = Some(level);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Jsonl);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_nothing_set_defers_level() {
        let config = LogConfig::from_lookup(lookup(&[("RUST_LOG", "trace")]), None, None);
        assert_eq!(config, LogConfig::default());
    }

    #[test]
    fn test_cli_beats_env() {
        let config = LogConfig::from_lookup(
            lookup(&[(ENV_LOG, "error"), (ENV_LOG_FORMAT, "human")]),
            Some(LogLevel::Trace),
            Some(LogFormat::Jsonl),
        );
        assert_eq!(config.level, Some(LogLevel::Trace));
        assert_eq!(config.format, LogFormat::Jsonl);
    }

    #[test]
    fn test_env_used_without_cli() {
        let config = LogConfig::from_lookup(
            lookup(&[
                (ENV_LOG, "debug"),
                (ENV_LOG_FORMAT, "jsonl"),
                (ENV_LOG_TIMESTAMPS, "0"),
            ]),
            None,
            None,
        );
        assert_eq!(config.level, Some(LogLevel::Debug));
        assert_eq!(config.format, LogFormat::Jsonl);
        assert!(!config.timestamps);
    }

    #[test]
    fn test_bad_env_values_ignored() {
        let config = LogConfig::from_lookup(
            lookup(&[(ENV_LOG, "chatty"), (ENV_LOG_FORMAT, "xml")]),
            None,
            None,
        );
        assert_eq!(config, LogConfig::default());
    }
}
