//! Engine Configuration
//!
//! Runtime settings for the orchestration engine. Every field has a default,
//! so a config file only needs the values it changes:
//!
//! ```yaml
//! workers: 8
//! watch_interval_ms: 250
//! default_wait_timeout_secs: 3600
//! ```

use std::fs;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::waiting::DEFAULT_RESPONSE_TTL;

/// Errors raised while loading or overriding configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unknown config key '{0}'")]
    UnknownKey(String),

    #[error("invalid value '{value}' for '{key}'")]
    InvalidValue { key: String, value: String },
}

/// Engine settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads advancing nodes
    pub workers: usize,

    /// Watcher tick interval in milliseconds
    pub watch_interval_ms: u64,

    /// How long notify responses are retained
    pub response_ttl_secs: u64,

    /// Wait timeout for TASK nodes that declare none; unset waits forever
    pub default_wait_timeout_secs: Option<u64>,

    /// Retries granted to failed dispatches when no adviser matches
    pub default_max_retries: u32,

    /// How long `shutdown` waits for in-flight jobs
    pub shutdown_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            watch_interval_ms: 500,
            response_ttl_secs: DEFAULT_RESPONSE_TTL.as_secs(),
            default_wait_timeout_secs: None,
            default_max_retries: 2,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// Loads settings from a YAML file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config = Self::from_yaml(&content)?;
        info!("Loaded engine config from {}", path);
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Applies a `key=value` override, as passed on the command line.
    pub fn apply_override(&mut self, assignment: &str) -> Result<(), ConfigError> {
        let (key, value) = assignment.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            key: assignment.to_string(),
            value: String::new(),
        })?;
        let key = key.trim();
        let value = value.trim();

        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "workers" => self.workers = value.parse().map_err(|_| invalid())?,
            "watch_interval_ms" => self.watch_interval_ms = value.parse().map_err(|_| invalid())?,
            "response_ttl_secs" => self.response_ttl_secs = value.parse().map_err(|_| invalid())?,
            "default_wait_timeout_secs" => {
                self.default_wait_timeout_secs = match value {
                    "" | "none" => None,
                    v => Some(v.parse().map_err(|_| invalid())?),
                }
            }
            "default_max_retries" => self.default_max_retries = value.parse().map_err(|_| invalid())?,
            "shutdown_grace_ms" => self.shutdown_grace_ms = value.parse().map_err(|_| invalid())?,
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms.max(1))
    }

    pub fn response_ttl(&self) -> Duration {
        Duration::from_secs(self.response_ttl_secs)
    }

    pub fn default_wait_timeout(&self) -> Option<Duration> {
        self.default_wait_timeout_secs.map(Duration::from_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.workers >= 1);
        assert_eq!(config.response_ttl(), Duration::from_secs(21 * 24 * 3600));
        assert_eq!(config.default_wait_timeout(), None);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml("workers: 3\ndefault_wait_timeout_secs: 60\n").unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.default_wait_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.watch_interval_ms, 500);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(EngineConfig::from_yaml("  \n").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        fs::write(&path, "watch_interval_ms: 20\n").unwrap();

        let config = EngineConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.watch_interval(), Duration::from_millis(20));

        let missing = dir.path().join("missing.yaml");
        assert!(matches!(
            EngineConfig::load(missing.to_str().unwrap()),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_overrides() {
        let mut config = EngineConfig::default();
        config.apply_override("workers=2").unwrap();
        config.apply_override("default_wait_timeout_secs = 30").unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.default_wait_timeout_secs, Some(30));

        config.apply_override("default_wait_timeout_secs=none").unwrap();
        assert_eq!(config.default_wait_timeout_secs, None);

        assert!(matches!(
            config.apply_override("colour=blue"),
            Err(ConfigError::UnknownKey(_))
        ));
        assert!(matches!(
            config.apply_override("workers=many"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(config.apply_override("workers").is_err());
    }
}
