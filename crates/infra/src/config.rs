//! Scheduler configuration.
//!
//! Loaded from an optional TOML file, then overridden by `JOBFORGE_*`
//! environment variables. Every field has a default, so an empty file (or
//! no file at all) is a valid configuration.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobforge_observability::{LogFormat, LoggingConfig};

use crate::jobs::{ManagerConfig, TriggerConfig};

pub const ENV_PREFIX: &str = "JOBFORGE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value `{value}` for {key}: {reason}")]
    InvalidEnv {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub claim_window_secs: u64,
    pub scan_limit: usize,
    /// Report automatic job errors instead of abandoning the entry.
    pub strict: bool,
    pub default_priority: i32,
    pub request_slice_ms: u64,
    pub cron_slice_secs: u64,
    pub blocking_slice_secs: u64,
    pub database_url: Option<String>,
    pub logging: LoggingConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            claim_window_secs: 15 * 60,
            scan_limit: 100,
            strict: false,
            default_priority: 100,
            request_slice_ms: 2_000,
            cron_slice_secs: 30,
            blocking_slice_secs: 8,
            database_url: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// File (if given) plus process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `JOBFORGE_*` variables, plus `DATABASE_URL` when the prefixed
    /// variable is absent.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        let fallback_url = std::env::var("DATABASE_URL")
            .ok()
            .map(|url| (format!("{ENV_PREFIX}DATABASE_URL"), url));
        let prefixed = std::env::vars().filter(|(key, _)| key.starts_with(ENV_PREFIX));
        self.apply_overrides(fallback_url.into_iter().chain(prefixed))
    }

    /// Apply `(KEY, value)` overrides. Unknown `JOBFORGE_*` keys are ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "CLAIM_WINDOW_SECS" => self.claim_window_secs = parse_env(key, value)?,
                "SCAN_LIMIT" => self.scan_limit = parse_env(key, value)?,
                "STRICT" => self.strict = parse_bool(key, value)?,
                "DEFAULT_PRIORITY" => self.default_priority = parse_env(key, value)?,
                "REQUEST_SLICE_MS" => self.request_slice_ms = parse_env(key, value)?,
                "CRON_SLICE_SECS" => self.cron_slice_secs = parse_env(key, value)?,
                "BLOCKING_SLICE_SECS" => self.blocking_slice_secs = parse_env(key, value)?,
                "DATABASE_URL" => self.database_url = Some(value.to_string()),
                "LOG_FORMAT" => self.logging.format = parse_env::<LogFormat>(key, value)?,
                "LOG_FILTER" => self.logging.filter = value.to_string(),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            claim_window: Duration::from_secs(self.claim_window_secs),
            scan_limit: self.scan_limit,
            strict: self.strict,
            default_priority: self.default_priority,
        }
    }

    pub fn trigger_config(&self) -> TriggerConfig {
        TriggerConfig {
            request_slice: Duration::from_millis(self.request_slice_ms),
            cron_slice: Duration::from_secs(self.cron_slice_secs),
            blocking_slice: Duration::from_secs(self.blocking_slice_secs),
        }
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
