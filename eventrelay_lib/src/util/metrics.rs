use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use std::collections::HashMap;

pub struct Metrics {
    pub registry: Registry,

    // per partition message flow
    pub messages_received: IntCounterVec,
    pub decode_errors: IntCounterVec,
    pub handler_failures: IntCounterVec,
    pub checkpoints: IntCounterVec,
    pub partition_errors: IntCounterVec,
    pub batch_durations: HistogramVec,

    // partition lifecycle
    pub partition_events: IntCounterVec,
    pub open_partitions: IntGauge,

    pub telemetry_flushes: IntCounterVec,
    pub telemetry_dropped: IntCounter,

    pub status: IntGaugeVec,
}

impl Metrics {
    pub fn new(consumer_group: &str) -> Self {
        let mut labels = HashMap::new();
        labels.insert("consumer_group".to_string(), consumer_group.to_string());
        // all of these are safe to unwrap as they only error when illegal arguments are passed, and none of these are dynamic
        let registry = Registry::new_custom(Some("eventrelay".to_string()), Some(labels)).unwrap();

        let messages_received = IntCounterVec::new(
            Opts::new("messages_received", "Messages delivered to the consumer loop"),
            &["partition"],
        )
        .unwrap();
        registry.register(Box::new(messages_received.clone())).unwrap();

        let decode_errors = IntCounterVec::new(
            Opts::new("decode_errors", "Messages skipped because their payload was not valid UTF-8"),
            &["partition"],
        )
        .unwrap();
        registry.register(Box::new(decode_errors.clone())).unwrap();

        let handler_failures = IntCounterVec::new(
            Opts::new("handler_failures", "Handler invocations that failed and interrupted their batch"),
            &["partition"],
        )
        .unwrap();
        registry.register(Box::new(handler_failures.clone())).unwrap();

        let checkpoints = IntCounterVec::new(
            Opts::new("checkpoints", "Checkpoint requests by result"),
            &["partition", "result"],
        )
        .unwrap();
        registry.register(Box::new(checkpoints.clone())).unwrap();

        let partition_errors = IntCounterVec::new(
            Opts::new("partition_errors", "Transport errors reported for a partition"),
            &["partition"],
        )
        .unwrap();
        registry.register(Box::new(partition_errors.clone())).unwrap();

        let batch_durations = HistogramVec::new(
            HistogramOpts::new("batch_durations", "Time spent handling a single batch")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["partition"],
        )
        .unwrap();
        registry.register(Box::new(batch_durations.clone())).unwrap();

        let partition_events = IntCounterVec::new(
            Opts::new("partition_events", "Partition lifecycle events"),
            &["event"],
        )
        .unwrap();
        registry.register(Box::new(partition_events.clone())).unwrap();

        let open_partitions = IntGauge::new("open_partitions", "Partitions currently assigned").unwrap();
        registry.register(Box::new(open_partitions.clone())).unwrap();

        let telemetry_flushes = IntCounterVec::new(
            Opts::new("telemetry_flushes", "Telemetry flushes by result"),
            &["result"],
        )
        .unwrap();
        registry.register(Box::new(telemetry_flushes.clone())).unwrap();

        let telemetry_dropped = IntCounter::new(
            "telemetry_dropped",
            "Telemetry events dropped because the buffer was full",
        )
        .unwrap();
        registry.register(Box::new(telemetry_dropped.clone())).unwrap();

        let status = IntGaugeVec::new(Opts::new("status", "Consumer loop status"), &["status"]).unwrap();
        registry.register(Box::new(status.clone())).unwrap();

        Metrics {
            registry,
            messages_received,
            decode_errors,
            handler_failures,
            checkpoints,
            partition_errors,
            batch_durations,
            partition_events,
            open_partitions,
            telemetry_flushes,
            telemetry_dropped,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_exposes_namespaced_families() {
        let metrics = Metrics::new("tests");
        metrics.messages_received.with_label_values(&["0"]).inc();
        metrics.open_partitions.set(2);

        let names: Vec<String> = metrics
            .registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();

        assert!(names.contains(&"eventrelay_messages_received".to_string()));
        assert!(names.contains(&"eventrelay_open_partitions".to_string()));
    }
}
