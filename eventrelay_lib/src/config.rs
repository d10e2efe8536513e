use std::time::Duration;

use serde::Deserialize;

use crate::kafka::{KafkaSettings, KafkaSourceOptions};
use crate::stream::ConsumerOptions;
use crate::util::error::ConfigError;

const ENV_PREFIX: &str = "RELAY_";

/// Process configuration, read from `RELAY_` prefixed environment variables.
#[derive(Clone, Debug, Deserialize)]
pub struct RelayConfig {
    pub stream_name: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    pub kafka_bootstrap: Option<String>,
    pub event_hubs_namespace: Option<String>,
    pub event_hubs_connection_string: Option<String>,
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_broker_version_fallback")]
    pub broker_version_fallback: String,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_partition_buffer")]
    pub partition_buffer: usize,
    #[serde(default = "default_assignment_poll_ms")]
    pub assignment_poll_ms: u64,

    pub telemetry_topic: Option<String>,
    #[serde(default = "default_telemetry_key")]
    pub telemetry_key: String,
    #[serde(default = "default_telemetry_flush_secs")]
    pub telemetry_flush_secs: u64,
    #[serde(default = "default_telemetry_buffer")]
    pub telemetry_buffer: usize,

    pub forward_topic: Option<String>,
    #[serde(default = "default_metrics_bind")]
    pub metrics_bind: String,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_consumer_group() -> String {
    "eventrelay".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_broker_version_fallback() -> String {
    "1.0.0".to_string()
}

fn default_max_batch_size() -> usize {
    100
}

fn default_partition_buffer() -> usize {
    1000
}

fn default_assignment_poll_ms() -> u64 {
    5000
}

fn default_telemetry_key() -> String {
    "eventrelay".to_string()
}

fn default_telemetry_flush_secs() -> u64 {
    5
}

fn default_telemetry_buffer() -> usize {
    10_000
}

fn default_metrics_bind() -> String {
    "127.0.0.1:9091".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(envy::prefixed(ENV_PREFIX).from_env()?)
    }

    pub fn from_iter<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::prefixed(ENV_PREFIX).from_iter(vars)?)
    }

    /// Broker settings, a plain bootstrap list wins over an Event Hubs namespace.
    pub fn kafka_settings(&self) -> Result<KafkaSettings, ConfigError> {
        let mut settings = match (
            &self.kafka_bootstrap,
            &self.event_hubs_namespace,
            &self.event_hubs_connection_string,
        ) {
            (Some(bootstrap), _, _) => KafkaSettings::new(bootstrap.as_str()),
            (None, Some(namespace), Some(connection_string)) => {
                KafkaSettings::event_hubs(namespace, connection_string)
            }
            _ => return Err(ConfigError::MissingBroker),
        };

        let overrides = [
            (&mut settings.security_protocol, &self.security_protocol),
            (&mut settings.sasl_mechanism, &self.sasl_mechanism),
            (&mut settings.sasl_username, &self.sasl_username),
            (&mut settings.sasl_password, &self.sasl_password),
            (&mut settings.ssl_ca_location, &self.ssl_ca_location),
        ];
        for (setting, value) in overrides {
            if value.is_some() {
                *setting = value.clone();
            }
        }

        settings.auto_offset_reset = self.auto_offset_reset.clone();
        settings.request_timeout_ms = self.request_timeout_ms;
        settings.broker_version_fallback = self.broker_version_fallback.clone();
        Ok(settings)
    }

    pub fn source_options(&self) -> KafkaSourceOptions {
        KafkaSourceOptions {
            max_batch_size: self.max_batch_size.max(1),
            partition_buffer: self.partition_buffer.max(1),
            assignment_poll_interval: Duration::from_millis(self.assignment_poll_ms.max(1)),
            ..KafkaSourceOptions::default()
        }
    }

    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            flush_interval: Duration::from_secs(self.telemetry_flush_secs.max(1)),
            shutdown_grace: Some(Duration::from_secs(self.shutdown_grace_secs)),
        }
    }
}
