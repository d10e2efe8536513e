use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::telemetry::TelemetrySink;
use crate::util::error::TelemetryFlushError;
use crate::util::Metrics;

// tokio intervals can't be zero
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Flushes a telemetry sink on a fixed interval in the background, and one last time when stopped.
pub struct TelemetryFlushScheduler {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl TelemetryFlushScheduler {
    pub fn spawn(sink: Arc<dyn TelemetrySink>, interval: Duration, metrics: Arc<Metrics>) -> Self {
        let interval = interval.max(MIN_INTERVAL);
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick fires right away, nothing to flush yet
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => flush_once(&sink, interval, &metrics).await,
                }
            }

            debug!("Telemetry flush scheduler stopping, flushing remaining events");
            flush_once(&sink, interval, &metrics).await;
        });

        TelemetryFlushScheduler { token, task }
    }

    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            error!("Telemetry flush task failed: {}", e);
        }
    }
}

async fn flush_once(sink: &Arc<dyn TelemetrySink>, timeout: Duration, metrics: &Metrics) {
    let result = match time::timeout(timeout, sink.flush()).await {
        Ok(result) => result,
        Err(_) => Err(TelemetryFlushError::Timeout),
    };

    match result {
        Ok(()) => metrics.telemetry_flushes.with_label_values(&["ok"]).inc(),
        Err(e) => {
            // never escalate, losing telemetry is acceptable
            warn!("Failed to flush telemetry: {}", e);
            metrics.telemetry_flushes.with_label_values(&["failed"]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetryEvent;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        queued: Mutex<Vec<TelemetryEvent>>,
        flushes: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl TelemetrySink for CountingSink {
        fn track_trace(&self, event: TelemetryEvent) {
            self.queued.lock().push(event);
        }

        async fn flush(&self) -> Result<(), TelemetryFlushError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(TelemetryFlushError::Export("unreachable".to_string()));
            }
            self.queued.lock().clear();
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_on_every_tick() {
        let sink = Arc::new(CountingSink::default());
        let metrics = Arc::new(Metrics::new("tests"));
        let scheduler = TelemetryFlushScheduler::spawn(sink.clone(), Duration::from_secs(5), metrics.clone());

        sink.track_trace(TelemetryEvent::trace("hello"));
        time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 1);
        assert!(sink.queued.lock().is_empty());

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 2);

        scheduler.stop().await;
        assert_eq!(sink.flushes.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.telemetry_flushes.with_label_values(&["ok"]).get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_absorbed() {
        let sink = Arc::new(CountingSink::default());
        sink.fail.store(true, Ordering::SeqCst);
        let metrics = Arc::new(Metrics::new("tests"));
        let scheduler = TelemetryFlushScheduler::spawn(sink.clone(), Duration::from_secs(1), metrics.clone());

        time::sleep(Duration::from_millis(3_500)).await;
        scheduler.stop().await;

        assert_eq!(sink.flushes.load(Ordering::SeqCst), 4);
        assert_eq!(metrics.telemetry_flushes.with_label_values(&["failed"]).get(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_still_flushes() {
        let sink = Arc::new(CountingSink::default());
        let metrics = Arc::new(Metrics::new("tests"));
        let scheduler = TelemetryFlushScheduler::spawn(sink.clone(), Duration::ZERO, metrics.clone());

        sink.track_trace(TelemetryEvent::trace("hello"));
        time::sleep(Duration::from_millis(10)).await;
        assert!(sink.flushes.load(Ordering::SeqCst) >= 1);

        scheduler.stop().await;
        let flushes = sink.flushes.load(Ordering::SeqCst) as u64;
        assert!(flushes >= 2);
        assert!(sink.queued.lock().is_empty());
        assert_eq!(metrics.telemetry_flushes.with_label_values(&["ok"]).get(), flushes);
    }
}
