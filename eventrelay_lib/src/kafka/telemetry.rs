use async_trait::async_trait;
use bincode::{Decode, Encode};
use futures_util::future::try_join_all;

use crate::kafka::KafkaSender;
use crate::telemetry::{Severity, TelemetryEvent, TelemetryExporter};
use crate::util::error::TelemetryFlushError;

/// Wire form of a telemetry event on the telemetry topic.
#[derive(Encode, Decode, Debug, Eq, PartialEq)]
pub struct TelemetryRecord {
    pub key: String,
    pub timestamp_ms: i64,
    pub severity: Severity,
    pub message: String,
    pub error: Option<String>,
}

impl TelemetryRecord {
    pub fn new(key: &str, event: TelemetryEvent) -> Self {
        TelemetryRecord {
            key: key.to_string(),
            timestamp_ms: event.timestamp.timestamp_millis(),
            severity: event.severity,
            message: event.message,
            error: event.error,
        }
    }
}

pub struct KafkaTelemetryExporter {
    sender: KafkaSender,
    topic: String,
    key: String,
}

impl KafkaTelemetryExporter {
    pub fn new(sender: KafkaSender, topic: impl Into<String>, key: impl Into<String>) -> Self {
        KafkaTelemetryExporter {
            sender,
            topic: topic.into(),
            key: key.into(),
        }
    }
}

#[async_trait]
impl TelemetryExporter for KafkaTelemetryExporter {
    async fn export(&self, events: Vec<TelemetryEvent>) -> Result<(), TelemetryFlushError> {
        let records: Vec<TelemetryRecord> = events
            .into_iter()
            .map(|event| TelemetryRecord::new(&self.key, event))
            .collect();

        try_join_all(
            records
                .iter()
                .map(|record| self.sender.send(&self.topic, Some(self.key.as_bytes()), record)),
        )
        .await?;

        Ok(())
    }
}
