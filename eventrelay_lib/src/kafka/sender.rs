use std::fmt::Debug;
use std::time::Duration;

use bincode::Encode;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::trace;

use crate::kafka::KafkaSettings;
use crate::util::error::KafkaSenderError;

pub struct KafkaSender(FutureProducer);

impl KafkaSender {
    pub fn new(settings: &KafkaSettings) -> Result<KafkaSender, KafkaError> {
        let producer = settings.client_config().set("compression.type", "gzip").create()?;
        Ok(KafkaSender(producer))
    }

    pub async fn send<T>(&self, destination: &str, key: Option<&[u8]>, payload: &T) -> Result<(), KafkaSenderError>
    where
        T: Encode + Debug,
    {
        trace!("Sending message to {}: {:?}", destination, payload);
        let payload = bincode::encode_to_vec(payload, bincode::config::standard())?;
        self.send_raw(destination, key, &payload).await
    }

    pub async fn send_raw(&self, destination: &str, key: Option<&[u8]>, payload: &[u8]) -> Result<(), KafkaSenderError> {
        let mut record = FutureRecord::<[u8], [u8]>::to(destination).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }

        let _ = self.0.send(record, Duration::from_secs(0)).await?;

        Ok(())
    }
}
