//! Partition-aware stream consumption.
//!
//! A [`StreamSource`] owns the connection, partition leases and offset storage. It calls back into a
//! [`PartitionProcessor`] from its own tasks: one task per assigned partition, so callbacks for the
//! same partition never overlap while different partitions run concurrently.
//! [`StreamConsumerLoop`] is the processor that ties a source to a [`MessageHandler`] and telemetry.

use std::sync::Arc;

use async_trait::async_trait;

use crate::util::error::{CheckpointError, PartitionError, SubscriptionError};
use crate::util::HandlerError;

pub use self::consumer_loop::{ConsumerOptions, StreamConsumerLoop};
pub use self::memory::{MemorySource, MemoryStep};
pub use self::message::Message;
pub use self::partition::{CloseReason, PartitionContext, STREAM_WIDE_PARTITION};

mod consumer_loop;
pub mod memory;
mod message;
mod partition;

/// What happened to a batch handed to [`PartitionProcessor::on_messages`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BatchOutcome {
    /// Every message was handled. `checkpointed` is false when the checkpoint request failed or the batch was empty.
    Completed { checkpointed: bool },
    /// The handler failed on `resume_from`; that message and everything after it in the batch still needs delivering.
    Interrupted { resume_from: i64 },
    /// The processor is stopping and did not look at the batch.
    Rejected,
}

#[async_trait]
pub trait PartitionProcessor: Send + Sync {
    async fn on_partition_opened(&self, context: &PartitionContext);

    async fn on_partition_closed(&self, context: &PartitionContext, reason: CloseReason);

    /// Messages must be in offset order for the partition.
    async fn on_messages(&self, context: &PartitionContext, batch: Vec<Message>) -> BatchOutcome;

    async fn on_error(&self, context: &PartitionContext, error: PartitionError);
}

#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn subscribe(
        &self,
        stream_name: &str,
        group_id: &str,
        processor: Arc<dyn PartitionProcessor>,
    ) -> Result<Box<dyn ProcessorHandle>, SubscriptionError>;

    /// Marks `offset` and everything before it on the partition as processed.
    async fn checkpoint(&self, context: &PartitionContext, offset: i64) -> Result<(), CheckpointError>;
}

#[async_trait]
pub trait ProcessorHandle: Send + Sync {
    /// Stops delivery, waits for in-flight batches and closes every open partition with
    /// [`CloseReason::Shutdown`]. Calling it again does nothing.
    async fn unregister(&self);
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Redelivery after a restart is expected, so this has to be idempotent.
    async fn handle(&self, context: &PartitionContext, message: &Message, text: &str) -> Result<(), HandlerError>;
}
