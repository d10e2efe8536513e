use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::util::error::TelemetryFlushError;
use crate::util::Metrics;

/// Ships a batch of buffered events somewhere durable.
#[async_trait]
pub trait TelemetryExporter: Send + Sync {
    async fn export(&self, events: Vec<TelemetryEvent>) -> Result<(), TelemetryFlushError>;
}

/// Queues events in memory until flushed. Holds at most `capacity` events, the oldest go first when full.
pub struct BufferedTelemetrySink<E> {
    exporter: E,
    buffer: Mutex<VecDeque<TelemetryEvent>>,
    capacity: usize,
    metrics: Option<Arc<Metrics>>,
}

impl<E: TelemetryExporter> BufferedTelemetrySink<E> {
    pub fn new(exporter: E, capacity: usize) -> Self {
        BufferedTelemetrySink {
            exporter,
            buffer: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }
}

#[async_trait]
impl<E: TelemetryExporter> TelemetrySink for BufferedTelemetrySink<E> {
    fn track_trace(&self, event: TelemetryEvent) {
        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.capacity {
            buffer.pop_front();
            if let Some(metrics) = &self.metrics {
                metrics.telemetry_dropped.inc();
            }
        }
        buffer.push_back(event);
    }

    async fn flush(&self) -> Result<(), TelemetryFlushError> {
        // swap the buffer out so tracing never waits on the export
        let events: Vec<TelemetryEvent> = self.buffer.lock().drain(..).collect();
        if events.is_empty() {
            return Ok(());
        }

        trace!("Exporting {} telemetry events", events.len());
        // a failed export loses the batch, telemetry is best effort
        self.exporter.export(events).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct CollectingExporter {
        exported: Mutex<Vec<TelemetryEvent>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl TelemetryExporter for Arc<CollectingExporter> {
        async fn export(&self, events: Vec<TelemetryEvent>) -> Result<(), TelemetryFlushError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TelemetryFlushError::Export("collector offline".to_string()));
            }
            self.exported.lock().extend(events);
            Ok(())
        }
    }

    #[tokio::test]
    async fn flush_drains_buffer_in_order() {
        let exporter = Arc::new(CollectingExporter::default());
        let sink = BufferedTelemetrySink::new(exporter.clone(), 10);

        sink.track_trace(TelemetryEvent::trace("first"));
        sink.track_trace(TelemetryEvent::error("second", "boom"));
        sink.flush().await.unwrap();

        let exported = exporter.exported.lock();
        assert_eq!(exported.len(), 2);
        assert_eq!(exported[0].message, "first");
        assert_eq!(exported[1].error.as_deref(), Some("boom"));
        assert_eq!(sink.buffered(), 0);
    }

    #[tokio::test]
    async fn full_buffer_drops_oldest() {
        let metrics = Arc::new(Metrics::new("tests"));
        let exporter = Arc::new(CollectingExporter::default());
        let sink = BufferedTelemetrySink::new(exporter.clone(), 2).with_metrics(metrics.clone());

        for message in ["a", "b", "c"] {
            sink.track_trace(TelemetryEvent::trace(message));
        }
        sink.flush().await.unwrap();

        let messages: Vec<String> = exporter.exported.lock().iter().map(|e| e.message.clone()).collect();
        assert_eq!(messages, vec!["b", "c"]);
        assert_eq!(metrics.telemetry_dropped.get(), 1);
    }

    #[tokio::test]
    async fn failed_export_discards_batch() {
        let exporter = Arc::new(CollectingExporter::default());
        exporter.fail.store(true, Ordering::SeqCst);
        let sink = BufferedTelemetrySink::new(exporter.clone(), 10);

        sink.track_trace(TelemetryEvent::trace("lost"));
        assert!(sink.flush().await.is_err());
        assert_eq!(sink.buffered(), 0);

        exporter.fail.store(false, Ordering::SeqCst);
        sink.flush().await.unwrap();
        assert!(exporter.exported.lock().is_empty());
    }
}
