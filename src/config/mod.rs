//! Application configuration.
//!
//! Aggregates broker, metrics and dispatch settings into a single Config
//! struct that can be loaded from YAML files or environment variables.

mod mqtt;

pub use mqtt::MqttConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "MQTT_EVENTS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "MQTT_EVENTS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "MQTT_EVENTS_LOG";

use serde::Deserialize;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cluster identity used as the `cluster` metrics label.
    pub cluster_id: String,
    /// Broker connection configuration.
    pub mqtt: MqttConfig,
    /// Metrics naming.
    pub metrics: MetricsConfig,
    /// Handler dispatch limits.
    pub dispatch: DispatchConfig,
}

/// Metric name prefix parts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub namespace: String,
    pub subsystem: String,
}

/// Handler dispatch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Handler invocations allowed to run at the same time.
    pub max_concurrent_handlers: usize,
    /// How long shutdown waits for running handlers, in milliseconds.
    pub drain_timeout_ms: u64,
    /// Skip handlers for events whose expiry has passed.
    pub drop_expired: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: 64,
            drain_timeout_ms: 5000,
            drop_expired: false,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("mqtt.brokers")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mqtt.validate()?;
        if self.dispatch.max_concurrent_handlers == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.max_concurrent_handlers must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self {
            cluster_id: "test-cluster".to_string(),
            ..Self::default()
        }
    }
}
