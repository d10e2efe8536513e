use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{Mutex, RwLock};
use tokio::time;
use tracing::{debug, warn};

use crate::stream::{
    BatchOutcome, CloseReason, Message, MessageHandler, PartitionContext, PartitionProcessor, ProcessorHandle,
    StreamSource,
};
use crate::telemetry::{Telemetry, TelemetryFlushScheduler};
use crate::util::error::{DecodeError, PartitionError, SubscriptionError};
use crate::util::{ConsumerStatus, HandlerError, Metrics, StatusCell};

#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    pub flush_interval: Duration,
    /// Upper bound for waiting on in-flight batches during `stop`, `None` waits for as long as it takes.
    pub shutdown_grace: Option<Duration>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            flush_interval: Duration::from_secs(5),
            shutdown_grace: Some(Duration::from_secs(30)),
        }
    }
}

/// Drives messages from a [`StreamSource`] into a [`MessageHandler`] with at-least-once semantics:
/// a partition is only checkpointed once every message before the checkpointed offset was handled.
pub struct StreamConsumerLoop {
    telemetry: Telemetry,
    metrics: Arc<Metrics>,
    options: ConsumerOptions,
    status: Arc<StatusCell>,
    running: Mutex<Option<Running>>,
}

struct Running {
    processor: Arc<LoopProcessor>,
    handle: Box<dyn ProcessorHandle>,
    flusher: TelemetryFlushScheduler,
}

impl StreamConsumerLoop {
    /// Every loop runs its own [`TelemetryFlushScheduler`] while started. Keep one loop per process when
    /// they share a sink, or the sink gets flushed once per loop.
    pub fn new(telemetry: Telemetry, metrics: Arc<Metrics>, options: ConsumerOptions) -> Self {
        StreamConsumerLoop {
            telemetry,
            status: Arc::new(StatusCell::new(metrics.clone())),
            metrics,
            options,
            running: Mutex::new(None),
        }
    }

    pub async fn start(
        &self,
        stream_name: &str,
        group_id: &str,
        source: Arc<dyn StreamSource>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), SubscriptionError> {
        // held until subscribed, a concurrent start waits and then finds the status changed
        let mut running = self.running.lock().await;
        if !self.status.is(ConsumerStatus::Starting) {
            return Err(SubscriptionError::AlreadyStarted);
        }

        self.telemetry.trace(format!(
            "Registering stream processor for '{}' as consumer group '{}'...",
            stream_name, group_id
        ));
        let flusher =
            TelemetryFlushScheduler::spawn(self.telemetry.sink(), self.options.flush_interval, self.metrics.clone());

        let processor = Arc::new(LoopProcessor {
            source: source.clone(),
            handler,
            telemetry: self.telemetry.clone(),
            metrics: self.metrics.clone(),
            status: self.status.clone(),
            drain: RwLock::new(()),
        });

        match source.subscribe(stream_name, group_id, processor.clone()).await {
            Ok(handle) => {
                self.status.set(ConsumerStatus::Running);
                *running = Some(Running {
                    processor,
                    handle,
                    flusher,
                });
                self.telemetry.trace("Receiving. Waiting for a stop signal to stop the worker.");
                Ok(())
            }
            Err(e) => {
                self.telemetry.error("Failed to register stream processor", &e);
                self.status.set(ConsumerStatus::Stopped);
                flusher.stop().await;
                Err(e)
            }
        }
    }

    /// Stops accepting new batches, unregisters from the source and waits for in-flight batches before
    /// the final telemetry flush. Safe to call any number of times.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(Running {
            processor,
            handle,
            flusher,
        }) = running.take()
        else {
            self.status.transition(ConsumerStatus::Starting, ConsumerStatus::Stopped);
            return;
        };

        self.status.set(ConsumerStatus::Stopping);
        self.telemetry.trace("Unregistering stream processor...");

        let drained = async {
            handle.unregister().await;
            // every in-flight batch holds a read guard
            drop(processor.drain.write().await);
        };
        match self.options.shutdown_grace {
            Some(grace) => {
                if time::timeout(grace, drained).await.is_err() {
                    warn!("In-flight batches did not finish within {:?}, stopping anyway", grace);
                }
            }
            None => drained.await,
        }

        self.status.set(ConsumerStatus::Stopped);
        self.telemetry.trace("Stream processor stopped.");
        flusher.stop().await;
    }

    pub fn status(&self) -> ConsumerStatus {
        self.status.get()
    }
}

/// The callbacks a source drives. Holds no per partition state, so concurrent calls for different
/// partitions are safe.
struct LoopProcessor {
    source: Arc<dyn StreamSource>,
    handler: Arc<dyn MessageHandler>,
    telemetry: Telemetry,
    metrics: Arc<Metrics>,
    status: Arc<StatusCell>,
    drain: RwLock<()>,
}

impl LoopProcessor {
    async fn invoke_handler(&self, context: &PartitionContext, message: &Message, text: &str) -> Result<(), HandlerError> {
        match AssertUnwindSafe(self.handler.handle(context, message, text))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => Err("handler panicked".into()),
        }
    }

    async fn checkpoint(&self, context: &PartitionContext, offset: i64) -> bool {
        match self.source.checkpoint(context, offset).await {
            Ok(()) => {
                debug!("Checkpointed {} at offset {}", context, offset);
                self.metrics
                    .checkpoints
                    .with_label_values(&[&context.partition_id, "ok"])
                    .inc();
                true
            }
            Err(e) => {
                // not fatal, the source redelivers from the previous checkpoint after a restart
                self.metrics
                    .checkpoints
                    .with_label_values(&[&context.partition_id, "failed"])
                    .inc();
                self.telemetry.error(
                    format!(
                        "Checkpoint failed. Partition: '{}', Offset: {}",
                        context.partition_id, offset
                    ),
                    &e,
                );
                false
            }
        }
    }
}

#[async_trait]
impl PartitionProcessor for LoopProcessor {
    async fn on_partition_opened(&self, context: &PartitionContext) {
        self.metrics.open_partitions.inc();
        self.metrics.partition_events.with_label_values(&["opened"]).inc();
        self.telemetry.trace(format!(
            "Stream processor initialized. Partition: '{}'",
            context.partition_id
        ));
    }

    async fn on_partition_closed(&self, context: &PartitionContext, reason: CloseReason) {
        self.metrics.open_partitions.dec();
        self.metrics.partition_events.with_label_values(&[reason.name()]).inc();
        self.telemetry.trace(format!(
            "Stream processor shutting down. Partition: '{}', Reason: '{}'.",
            context.partition_id, reason
        ));
    }

    async fn on_messages(&self, context: &PartitionContext, batch: Vec<Message>) -> BatchOutcome {
        let _in_flight = self.drain.read().await;
        // sources may start delivering before subscribe returns
        if !matches!(self.status.get(), ConsumerStatus::Starting | ConsumerStatus::Running) {
            debug!("Rejecting {} messages for {}, the consumer is stopping", batch.len(), context);
            return BatchOutcome::Rejected;
        }

        let _timer = self
            .metrics
            .batch_durations
            .with_label_values(&[&context.partition_id])
            .start_timer();
        let mut last_handled = None;

        for message in &batch {
            self.metrics
                .messages_received
                .with_label_values(&[&context.partition_id])
                .inc();

            let text = match message.text() {
                Ok(text) => text,
                Err(e) => {
                    self.metrics
                        .decode_errors
                        .with_label_values(&[&context.partition_id])
                        .inc();
                    self.telemetry
                        .error("Skipping message", &DecodeError::new(context, message.offset, e));
                    last_handled = Some(message.offset);
                    continue;
                }
            };

            self.telemetry.trace(format!(
                "Message received. Partition: '{}', Offset: {}, Data: '{}'",
                context.partition_id, message.offset, text
            ));

            if let Err(e) = self.invoke_handler(context, message, text).await {
                self.metrics
                    .handler_failures
                    .with_label_values(&[&context.partition_id])
                    .inc();
                self.telemetry.error(
                    format!(
                        "Handler failed. Partition: '{}', Offset: {}",
                        context.partition_id, message.offset
                    ),
                    &*e,
                );
                if let Some(offset) = last_handled {
                    self.checkpoint(context, offset).await;
                }
                return BatchOutcome::Interrupted {
                    resume_from: message.offset,
                };
            }
            last_handled = Some(message.offset);
        }

        let checkpointed = match last_handled {
            Some(offset) => self.checkpoint(context, offset).await,
            None => false,
        };
        BatchOutcome::Completed { checkpointed }
    }

    async fn on_error(&self, context: &PartitionContext, error: PartitionError) {
        self.metrics
            .partition_errors
            .with_label_values(&[&context.partition_id])
            .inc();
        self.telemetry
            .error(format!("Error on partition: {}", context.partition_id), &error);
    }
}
