use std::error::Error;
use std::str::Utf8Error;

use bincode::error::EncodeError;
use rdkafka::error::KafkaError;
use rdkafka::message::OwnedMessage;
use thiserror::Error;

use crate::stream::PartitionContext;

/// Error type handlers return, anything goes as long as it can cross threads.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Raised by `start`, the only error that is fatal to the process.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Unknown stream '{0}'")]
    UnknownStream(String),
    #[error("Consumer group '{group}' could not be resolved for stream '{stream}'")]
    UnknownGroup { stream: String, group: String },
    #[error("The consumer loop was already started")]
    AlreadyStarted,
    #[error("Failed to fetch stream metadata: {0}")]
    Metadata(String),
    #[error("Failed to subscribe to kafka: {0}")]
    Kafka(#[from] KafkaError),
}

#[derive(Debug, Error)]
#[error("Failed to decode message at offset {offset} on partition '{partition_id}': {source}")]
pub struct DecodeError {
    pub partition_id: String,
    pub offset: i64,
    #[source]
    pub source: Utf8Error,
}

impl DecodeError {
    pub fn new(context: &PartitionContext, offset: i64, source: Utf8Error) -> Self {
        DecodeError {
            partition_id: context.partition_id.clone(),
            offset,
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("{0}")]
    Transport(String),
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("No active subscription to checkpoint against")]
    NotSubscribed,
    #[error("Partition id '{0}' is not valid for this source")]
    InvalidPartition(String),
    #[error("Checkpoint rejected: {0}")]
    Rejected(String),
    #[error("Failed to commit offsets: {0}")]
    Kafka(#[from] KafkaError),
}

#[derive(Debug, Error)]
pub enum TelemetryFlushError {
    #[error("Failed to export telemetry: {0}")]
    Export(String),
    #[error("Telemetry flush did not finish in time")]
    Timeout,
    #[error(transparent)]
    Kafka(#[from] KafkaSenderError),
}

#[derive(Debug, Error)]
pub enum KafkaSenderError {
    #[error("Failed to encode payload: {0}")]
    Encode(#[from] EncodeError),
    #[error("Failed to send message to kafka: {0}")]
    Kafka(#[from] KafkaError),
}

impl From<(KafkaError, OwnedMessage)> for KafkaSenderError {
    fn from(e: (KafkaError, OwnedMessage)) -> Self {
        let (e, _) = e;
        KafkaSenderError::Kafka(e)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid environment configuration: {0}")]
    Env(#[from] envy::Error),
    #[error("No broker configured, set RELAY_KAFKA_BOOTSTRAP or both RELAY_EVENT_HUBS_NAMESPACE and RELAY_EVENT_HUBS_CONNECTION_STRING")]
    MissingBroker,
}
