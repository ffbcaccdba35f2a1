//! Backoff builders for broker connection retries.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::config::MqttConfig;

/// Backoff for broker connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Connection backoff whose delay cap follows `max_reconnect_interval`.
pub fn connection_backoff_for(config: &MqttConfig) -> ExponentialBuilder {
    connection_backoff().with_max_delay(Duration::from_secs(config.max_reconnect_interval.max(1)))
}
