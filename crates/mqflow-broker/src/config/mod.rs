//! Broker configuration and limits.
//!
//! Supports configuration from:
//! - TOML file (default: `mqflow.toml`)
//! - Environment variables with `MQFLOW__` prefix (double underscore for nesting)
//! - In-file variable substitution: `${VAR}` or `${VAR:-default}`
//!
//! Environment variable examples:
//! - `MQFLOW__SERVER__BIND=0.0.0.0:1884`
//! - `MQFLOW__LIMITS__MAX_QUEUED=5000`
//! - `MQFLOW__MQTT__MAX_QOS=1`
//!
//! In-file substitution examples:
//! ```toml
//! [server]
//! bind = "${MQTT_HOST:-0.0.0.0}:${MQTT_PORT:-1883}"
//! ```

mod limits;
mod log;
mod mqtt;
mod server;
mod session;

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

pub use limits::{
    LimitsConfig, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_INFLIGHT, DEFAULT_MAX_PACKET_SIZE,
    DEFAULT_MAX_QUEUED, DEFAULT_MAX_TOPIC_LENGTH, DEFAULT_MAX_TOPIC_LEVELS,
};
pub use log::LogConfig;
pub use mqtt::MqttConfig;
pub use server::{ServerConfig, DEFAULT_PORT, DEFAULT_SESSION_EXPIRY_CHECK};
pub use session::{
    SessionConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_KEEP_ALIVE, DEFAULT_SESSION_EXPIRY,
};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "mqflow.toml";

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "MQFLOW";

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(format!("substitution pattern: {}", e)))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub log: LogConfig,
    /// Server configuration.
    pub server: ServerConfig,
    /// Limits configuration.
    pub limits: LimitsConfig,
    /// Session configuration.
    pub session: SessionConfig,
    /// MQTT feature configuration.
    pub mqtt: MqttConfig,
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Config parsing/loading error.
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
    /// Invalid configuration value.
    #[error("Validation error: {0}")]
    Validation(String),
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    /// Overrides use the `MQFLOW__` prefix with double underscores for nesting:
    /// - `MQFLOW__SERVER__BIND=0.0.0.0:1884`
    /// - `MQFLOW__SESSION__SESSION_EXPIRY=3600`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", format!("0.0.0.0:{}", DEFAULT_PORT))?
            .set_default("server.workers", 0)?
            .set_default(
                "server.session_expiry_check",
                DEFAULT_SESSION_EXPIRY_CHECK as i64,
            )?
            .set_default("limits.max_packet_size", DEFAULT_MAX_PACKET_SIZE as i64)?
            .set_default("limits.max_topic_length", DEFAULT_MAX_TOPIC_LENGTH as i64)?
            .set_default("limits.max_topic_levels", DEFAULT_MAX_TOPIC_LEVELS as i64)?
            .set_default("limits.max_inflight", DEFAULT_MAX_INFLIGHT as i64)?
            .set_default("limits.max_queued", DEFAULT_MAX_QUEUED as i64)?
            .set_default("limits.max_connections", DEFAULT_MAX_CONNECTIONS as i64)?
            .set_default("session.max_keep_alive", DEFAULT_MAX_KEEP_ALIVE as i64)?
            .set_default("session.session_expiry", DEFAULT_SESSION_EXPIRY as i64)?
            .set_default("session.connect_timeout", DEFAULT_CONNECT_TIMEOUT as i64)?
            .set_default("mqtt.max_qos", 2)?
            .set_default("mqtt.retain_available", true)?
            .set_default("mqtt.wildcard_subscriptions", true)?;

        let path = path.as_ref();
        if path.is_file() {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content)?;
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content)?;
        let config: Config = toml::from_str(&substituted)
            .map_err(|e| ConfigError::Validation(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log.validate().map_err(ConfigError::Validation)?;
        self.limits.validate().map_err(ConfigError::Validation)?;
        self.session.validate().map_err(ConfigError::Validation)?;
        self.mqtt.validate().map_err(ConfigError::Validation)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[log]
level = "debug"

[server]
bind = "127.0.0.1:1884"
workers = 4
session_expiry_check = 5

[limits]
max_packet_size = 2097152
max_topic_levels = 64
max_inflight = 10
max_queued = 50

[session]
max_keep_alive = 300
session_expiry = 3600

[mqtt]
max_qos = 1
retain_available = false
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.server.bind.port(), 1884);
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.server.session_expiry_check, 5);
        assert_eq!(config.limits.max_packet_size, 2097152);
        assert_eq!(config.limits.max_topic_levels, 64);
        assert_eq!(config.limits.max_inflight, 10);
        assert_eq!(config.limits.max_queued, 50);
        assert_eq!(config.session.max_keep_alive, 300);
        assert_eq!(config.session.session_expiry, 3600);
        assert_eq!(config.mqtt.max_qos, 1);
        assert!(!config.mqtt.retain_available);
        assert!(config.mqtt.wildcard_subscriptions);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
[limits]
max_queued = 10
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.limits.max_queued, 10);
        assert_eq!(config.limits.max_topic_levels, DEFAULT_MAX_TOPIC_LEVELS);
        assert_eq!(config.server.bind.port(), 1883);
        assert_eq!(config.mqtt.max_qos, 2);
        assert_eq!(config.session.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn test_parse_rejects_invalid_values() {
        let err = Config::parse("[mqtt]\nmax_qos = 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        let err = Config::parse("[log]\nlevel = \"chatty\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/mqflow-test.toml").unwrap();
        assert_eq!(config.server.bind.port(), DEFAULT_PORT);
        assert_eq!(config.limits.max_inflight, DEFAULT_MAX_INFLIGHT);
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("MQFLOW_TEST_PORT", "1885");
        let content = r#"
[server]
bind = "0.0.0.0:${MQFLOW_TEST_PORT}"
"#;
        let substituted = substitute_env_vars(content).unwrap();
        assert!(substituted.contains("0.0.0.0:1885"));
        std::env::remove_var("MQFLOW_TEST_PORT");
    }

    #[test]
    fn test_env_var_substitution_with_default() {
        std::env::remove_var("MQFLOW_NONEXISTENT_VAR");
        let content = r#"bind = "${MQFLOW_NONEXISTENT_VAR:-0.0.0.0:1883}""#;
        let substituted = substitute_env_vars(content).unwrap();
        assert!(substituted.contains("0.0.0.0:1883"));
    }
}
