//! Broker connection configuration.

use serde::Deserialize;

use super::ConfigError;

/// MQTT broker configuration.
///
/// Timeouts are in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker addresses as `host:port`, tried in order on the initial connect.
    pub brokers: Vec<String>,
    /// Client identity used when the caller does not supply one.
    pub client_id: String,
    pub user: String,
    pub password: String,
    /// Keep-alive interval; a missing ping response is detected within it.
    pub ping_timeout: u64,
    /// Upper bound of the reconnect backoff.
    pub max_reconnect_interval: u64,
    /// Bound on each initial connect attempt.
    pub connect_timeout: u64,
    /// Bound on waiting for subscribe/publish acknowledgements.
    pub operation_timeout: u64,
    /// Depth of the client's request channel.
    pub message_channel_depth: usize,
    /// Graceful disconnect wait, in milliseconds.
    pub disconnect_quiesce_ms: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:1883".to_string()],
            client_id: String::new(),
            user: String::new(),
            password: String::new(),
            ping_timeout: 10,
            max_reconnect_interval: 10,
            connect_timeout: 30,
            operation_timeout: 10,
            message_channel_depth: 100,
            disconnect_quiesce_ms: 200,
        }
    }
}

impl MqttConfig {
    /// Check broker addresses and timeouts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.is_empty() {
            return Err(ConfigError::Invalid(
                "mqtt.brokers must list at least one broker".to_string(),
            ));
        }

        for broker in &self.brokers {
            let valid = broker
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(ConfigError::Invalid(format!(
                    "mqtt.brokers entry '{}' is not host:port",
                    broker
                )));
            }
        }

        for (name, value) in [
            ("ping_timeout", self.ping_timeout),
            ("max_reconnect_interval", self.max_reconnect_interval),
            ("connect_timeout", self.connect_timeout),
            ("operation_timeout", self.operation_timeout),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "mqtt.{} must be positive",
                    name
                )));
            }
        }

        if self.message_channel_depth == 0 {
            return Err(ConfigError::Invalid(
                "mqtt.message_channel_depth must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolve the client identity.
    ///
    /// A non-empty caller identity wins over the configured one; when both are
    /// empty an identity is derived from the process id.
    pub fn resolve_client_id(&self, caller: &str) -> String {
        if !caller.is_empty() {
            return caller.to_string();
        }
        if !self.client_id.is_empty() {
            return self.client_id.clone();
        }
        format!("mqtt-events-{}", std::process::id())
    }
}
