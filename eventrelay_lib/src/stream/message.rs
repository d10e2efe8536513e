use std::str::Utf8Error;

use chrono::{DateTime, Utc};

/// A single record received from a partition. Offsets are only comparable within one partition.
#[derive(Clone, Debug)]
pub struct Message {
    pub partition_id: String,
    pub offset: i64,
    pub sequence_number: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    /// When the broker accepted the record, if it reported it.
    pub enqueued_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

impl Message {
    pub fn new(partition_id: impl Into<String>, offset: i64, payload: impl Into<Vec<u8>>) -> Self {
        Message {
            partition_id: partition_id.into(),
            offset,
            sequence_number: offset,
            key: None,
            payload: payload.into(),
            enqueued_at: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_enqueued_at(mut self, enqueued_at: DateTime<Utc>) -> Self {
        self.enqueued_at = Some(enqueued_at);
        self
    }

    pub fn text(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_follows_offset() {
        let message = Message::new("p0", 42, "HR");
        assert_eq!(message.sequence_number, 42);
        assert_eq!(message.text().unwrap(), "HR");
        assert!(message.key.is_none());
    }

    #[test]
    fn invalid_utf8_is_reported() {
        let message = Message::new("p1", 10, vec![0xff, 0xfe, 0x41]);
        let error = message.text().unwrap_err();
        assert_eq!(error.valid_up_to(), 0);
    }
}
