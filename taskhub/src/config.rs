//! Engine configuration
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. a TOML file named by `TASKHUB_CONFIG` (optional)
//! 3. `TASKHUB_*` environment overrides

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::actors::dispatcher::RetryPolicy;

pub const CONFIG_PATH_ENV: &str = "TASKHUB_CONFIG";

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },
    #[error("invalid config: {0}")]
    Parse(String),
    #[error("failed to parse env var {key}={value}: {message}")]
    Env {
        key: String,
        value: String,
        message: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub broker: BrokerConfig,
    pub tracer: TracerConfig,
    pub dispatcher: DispatcherConfig,
    pub ledger: LedgerConfig,
    pub server: ServerConfig,
    pub manifests: ManifestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Delay between `request-submitted` and `request-ready`
    pub ready_delay_ms: u64,
    /// Claim deadline stored on requests submitted without one
    pub default_max_time_ms: Option<u64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ready_delay_ms: 5,
            default_max_time_ms: Some(30_000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TracerConfig {
    /// Weight of a new sample in the response-time EMA
    pub response_time_smoothing: f64,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            response_time_smoothing: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// α in `new = (1 - α) * old + α * sample` for bank/capability metrics
    pub metrics_smoothing: f64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            metrics_smoothing: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LedgerConfig {
    /// Archived requests kept in memory before the oldest are evicted
    pub archive_limit: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            archive_limit: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManifestConfig {
    /// Directory scanned for `*.toml` task manifests
    pub dir: Option<PathBuf>,
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&raw)
    }

    /// Defaults, then `TASKHUB_CONFIG` (if set), then env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => {
                tracing::info!(path = %path, "Loading engine config");
                Self::from_file(Path::new(&path))?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `TASKHUB_*` overrides read through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup("TASKHUB_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse(&lookup, "TASKHUB_PORT")? {
            self.server.port = port;
        }
        if let Some(max_retries) = env_parse(&lookup, "TASKHUB_MAX_RETRIES")? {
            self.retry.max_retries = max_retries;
        }
        if let Some(dir) = lookup("TASKHUB_MANIFEST_DIR") {
            self.manifests.dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Env {
                key: key.to_string(),
                message: e.to_string(),
                value,
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::ErrorCategory;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.broker.ready_delay_ms, 5);
        assert_eq!(config.tracer.response_time_smoothing, 0.2);
        assert_eq!(config.dispatcher.metrics_smoothing, 0.1);
        assert_eq!(config.ledger.archive_limit, 10_000);
        assert_eq!(config.server.bind_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [retry]
            max_retries = 5
            retryable_categories = ["timeout", "processing"]

            [server]
            port = 9000
            "#,
        )
        .unwrap();

        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.max_delay_ms, 10_000);
        assert!(config.retry.retryable_categories.contains(&ErrorCategory::Processing));
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.broker, BrokerConfig::default());
    }

    #[test]
    fn test_example_config_matches_defaults() {
        let config =
            EngineConfig::from_toml_str(include_str!("../config/taskhub.example.toml")).unwrap();
        let expected = EngineConfig {
            manifests: ManifestConfig {
                dir: Some(PathBuf::from("config/manifests")),
            },
            ..EngineConfig::default()
        };
        assert_eq!(config, expected);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[broker]\nready_delay_ms = 20").unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.broker.ready_delay_ms, 20);

        let missing = EngineConfig::from_file(Path::new("/nonexistent/taskhub.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let result = EngineConfig::from_toml_str("[retry]\nmax_retries = \"many\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TASKHUB_PORT", "7070"),
            ("TASKHUB_HOST", "0.0.0.0"),
            ("TASKHUB_MAX_RETRIES", "1"),
            ("TASKHUB_MANIFEST_DIR", "/etc/taskhub/manifests"),
        ]
        .into_iter()
        .collect();

        let mut config = EngineConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.bind_addr(), "0.0.0.0:7070");
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(
            config.manifests.dir,
            Some(PathBuf::from("/etc/taskhub/manifests"))
        );
    }

    #[test]
    fn test_bad_env_value_is_reported() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(|key| (key == "TASKHUB_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { ref key, .. } if key == "TASKHUB_PORT"));
    }
}
