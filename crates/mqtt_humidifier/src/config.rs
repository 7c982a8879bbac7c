use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;

#[cfg(feature = "integration_mqtt")]
use crate::integrations::MqttConfig;

/// Errors raised while loading the daemon configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub integrations: IntegrationsConfig,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `"mqtt_humidifier::integrations::mqtt" = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Build the subscriber filter: the default level plus per-target overrides.
    pub fn filter(&self) -> Targets {
        Targets::new()
            .with_default(LevelFilter::from(self.level))
            .with_targets(
                self.overrides
                    .iter()
                    .map(|(target, level)| (target.clone(), LevelFilter::from(*level))),
            )
    }
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8565
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,

    /// Address to bind the HTTP API to
    #[serde(default = "default_api_listen")]
    pub listen: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntegrationsConfig {
    #[cfg(feature = "integration_mqtt")]
    pub mqtt: Option<MqttConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl std::str::FromStr for Config {
    type Err = toml::de::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = "".parse().unwrap();

        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(config.logging.overrides.is_empty());
        assert!(config.api.enabled);
        assert_eq!(config.api.listen, "127.0.0.1");
        assert_eq!(config.api.port, 8565);
        assert!(config.integrations.mqtt.is_none());
    }

    #[test]
    fn test_logging_overrides() {
        let config: Config = r#"
            [logging]
            level = "warn"

            [logging.overrides]
            "mqtt_humidifier::integrations::mqtt" = "trace"
        "#
        .parse()
        .unwrap();

        assert_eq!(config.logging.level, LogLevel::Warn);
        assert_eq!(
            config.logging.overrides["mqtt_humidifier::integrations::mqtt"],
            LogLevel::Trace
        );

        let filter = config.logging.filter();
        assert!(filter.would_enable("mqtt_humidifier::integrations::mqtt", &tracing::Level::TRACE));
        assert!(!filter.would_enable("mqtt_humidifier::engine", &tracing::Level::INFO));
    }

    #[test]
    fn test_unknown_section_is_rejected() {
        let result: Result<Config, _> = r#"
            [automations]
            enabled = true
        "#
        .parse();

        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_log_level_is_rejected() {
        let result: Result<Config, _> = r#"
            [logging]
            level = "loud"
        "#
        .parse();

        assert!(result.is_err());
    }
}
