use std::fmt::{Display, Formatter};

use uuid::Uuid;

/// Partition id used for errors that can't be pinned on a single partition.
pub const STREAM_WIDE_PARTITION: &str = "*";

/// Identifies where a batch came from. Lives for one open/close cycle of a partition assignment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionContext {
    pub stream_name: String,
    pub consumer_group: String,
    pub partition_id: String,
    // instance that owns the assignment
    pub owner: Uuid,
}

impl PartitionContext {
    pub fn new(stream_name: &str, consumer_group: &str, partition_id: impl Into<String>, owner: Uuid) -> Self {
        PartitionContext {
            stream_name: stream_name.to_string(),
            consumer_group: consumer_group.to_string(),
            partition_id: partition_id.into(),
            owner,
        }
    }

    pub fn stream_wide(stream_name: &str, consumer_group: &str, owner: Uuid) -> Self {
        Self::new(stream_name, consumer_group, STREAM_WIDE_PARTITION, owner)
    }

    pub fn is_stream_wide(&self) -> bool {
        self.partition_id == STREAM_WIDE_PARTITION
    }
}

impl Display for PartitionContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.stream_name, self.partition_id)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseReason {
    Shutdown,
    LeaseLost,
    LeaseStolen,
    TransportError,
}

impl CloseReason {
    pub fn name(&self) -> &'static str {
        match self {
            CloseReason::Shutdown => "Shutdown",
            CloseReason::LeaseLost => "LeaseLost",
            CloseReason::LeaseStolen => "LeaseStolen",
            CloseReason::TransportError => "TransportError",
        }
    }
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_wide_context() {
        let context = PartitionContext::stream_wide("baseball-events", "relay", Uuid::nil());
        assert!(context.is_stream_wide());
        assert_eq!(context.to_string(), "baseball-events[*]");

        let context = PartitionContext::new("baseball-events", "relay", "3", Uuid::nil());
        assert!(!context.is_stream_wide());
    }
}
