use rdkafka::config::RDKafkaLogLevel;
use rdkafka::ClientConfig;

pub use self::listener::{KafkaSource, KafkaSourceOptions};
pub use self::sender::KafkaSender;
pub use self::telemetry::{KafkaTelemetryExporter, TelemetryRecord};

pub mod listener;
pub mod sender;
pub mod telemetry;

const EVENT_HUBS_DOMAIN: &str = "servicebus.windows.net";
const EVENT_HUBS_KAFKA_PORT: u16 = 9093;

/// Connection settings shared by every client this crate creates.
#[derive(Clone, Debug)]
pub struct KafkaSettings {
    pub bootstrap_servers: String,
    pub security_protocol: Option<String>,
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub request_timeout_ms: u64,
    pub broker_version_fallback: String,
    pub auto_offset_reset: String,
}

impl KafkaSettings {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        KafkaSettings {
            bootstrap_servers: bootstrap_servers.into(),
            security_protocol: None,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            request_timeout_ms: 60_000,
            broker_version_fallback: "1.0.0".to_string(),
            auto_offset_reset: "earliest".to_string(),
        }
    }

    /// Settings for the Kafka endpoint of an Event Hubs namespace, which authenticates with the
    /// namespace connection string as SASL PLAIN password.
    pub fn event_hubs(namespace: &str, connection_string: &str) -> Self {
        let host = if namespace.contains('.') {
            namespace.to_string()
        } else {
            format!("{}.{}", namespace, EVENT_HUBS_DOMAIN)
        };

        let mut settings = KafkaSettings::new(format!("{}:{}", host, EVENT_HUBS_KAFKA_PORT));
        settings.security_protocol = Some("SASL_SSL".to_string());
        settings.sasl_mechanism = Some("PLAIN".to_string());
        settings.sasl_username = Some("$ConnectionString".to_string());
        settings.sasl_password = Some(connection_string.to_string());
        settings
    }

    pub(crate) fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("request.timeout.ms", self.request_timeout_ms.to_string())
            .set("broker.version.fallback", &self.broker_version_fallback)
            .set_log_level(RDKafkaLogLevel::Warning);

        let optional = [
            ("security.protocol", &self.security_protocol),
            ("sasl.mechanism", &self.sasl_mechanism),
            ("sasl.username", &self.sasl_username),
            ("sasl.password", &self.sasl_password),
            ("ssl.ca.location", &self.ssl_ca_location),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                config.set(key, value);
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_hubs_endpoint() {
        let settings = KafkaSettings::event_hubs("scores", "Endpoint=sb://scores/;SharedAccessKey=abc");
        let config = settings.client_config();

        assert_eq!(config.get("bootstrap.servers"), Some("scores.servicebus.windows.net:9093"));
        assert_eq!(config.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(config.get("sasl.username"), Some("$ConnectionString"));
        assert_eq!(config.get("sasl.password"), Some("Endpoint=sb://scores/;SharedAccessKey=abc"));
        assert_eq!(config.get("ssl.ca.location"), None);
    }

    #[test]
    fn fully_qualified_namespace_is_kept() {
        let settings = KafkaSettings::event_hubs("scores.servicebus.chinacloudapi.cn", "secret");
        assert_eq!(settings.bootstrap_servers, "scores.servicebus.chinacloudapi.cn:9093");
    }

    #[test]
    fn plain_broker_has_no_security_settings() {
        let config = KafkaSettings::new("localhost:9092").client_config();
        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("request.timeout.ms"), Some("60000"));
        assert_eq!(config.get("security.protocol"), None);
    }
}
