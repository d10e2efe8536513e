use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use bincode::{Decode, Encode};
use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::util::error::TelemetryFlushError;

pub use self::buffered::{BufferedTelemetrySink, TelemetryExporter};
pub use self::scheduler::TelemetryFlushScheduler;

mod buffered;
mod scheduler;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Encode, Decode)]
pub enum Severity {
    Information,
    Error,
}

#[derive(Clone, Debug)]
pub struct TelemetryEvent {
    pub message: String,
    pub error: Option<String>,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn trace(message: impl Into<String>) -> Self {
        TelemetryEvent {
            message: message.into(),
            error: None,
            severity: Severity::Information,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>, error: impl Into<String>) -> Self {
        TelemetryEvent {
            message: message.into(),
            error: Some(error.into()),
            severity: Severity::Error,
            timestamp: Utc::now(),
        }
    }
}

/// Destination for trace telemetry. Shared by every partition, so implementations synchronize internally.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Queues the event, never waits on I/O.
    fn track_trace(&self, event: TelemetryEvent);

    async fn flush(&self) -> Result<(), TelemetryFlushError>;
}

/// Sink for when no telemetry destination is configured, the log line is all that remains.
pub struct DisabledTelemetry;

#[async_trait]
impl TelemetrySink for DisabledTelemetry {
    fn track_trace(&self, _event: TelemetryEvent) {}

    async fn flush(&self) -> Result<(), TelemetryFlushError> {
        Ok(())
    }
}

/// Reports every trace twice: as a log line and to the telemetry sink.
#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Telemetry { sink }
    }

    pub fn disabled() -> Self {
        Telemetry::new(Arc::new(DisabledTelemetry))
    }

    pub fn sink(&self) -> Arc<dyn TelemetrySink> {
        self.sink.clone()
    }

    pub fn trace(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.sink.track_trace(TelemetryEvent::trace(message));
    }

    pub fn error(&self, message: impl Into<String>, error: &dyn Error) {
        let message = message.into();
        error!("{}: {}", message, error);
        self.sink.track_trace(TelemetryEvent::error(message, error.to_string()));
    }

    pub async fn flush(&self) -> Result<(), TelemetryFlushError> {
        self.sink.flush().await
    }
}
