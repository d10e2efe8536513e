use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::util::Metrics;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConsumerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl ConsumerStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ConsumerStatus::Starting => "STARTING",
            ConsumerStatus::Running => "RUNNING",
            ConsumerStatus::Stopping => "STOPPING",
            ConsumerStatus::Stopped => "STOPPED",
        }
    }
}

/// Current status of a consumer loop, mirrored into the `status` gauge.
pub struct StatusCell {
    status: RwLock<ConsumerStatus>,
    metrics: Arc<Metrics>,
}

impl StatusCell {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        metrics
            .status
            .with_label_values(&[ConsumerStatus::Starting.name()])
            .set(1);
        StatusCell {
            status: RwLock::new(ConsumerStatus::Starting),
            metrics,
        }
    }

    pub fn set(&self, new_status: ConsumerStatus) {
        // get lock
        let mut status = self.status.write();
        if *status == new_status {
            return;
        }

        info!("Consumer status change: {} => {}", status.name(), new_status.name());

        // update metrics
        self.metrics.status.reset();
        self.metrics.status.with_label_values(&[new_status.name()]).set(1);

        //store new status
        *status = new_status;
    }

    /// Moves to `new_status` only when currently in `expected`, returns whether it did.
    pub fn transition(&self, expected: ConsumerStatus, new_status: ConsumerStatus) -> bool {
        let mut status = self.status.write();
        if *status != expected {
            return false;
        }

        info!("Consumer status change: {} => {}", status.name(), new_status.name());
        self.metrics.status.reset();
        self.metrics.status.with_label_values(&[new_status.name()]).set(1);
        *status = new_status;
        true
    }

    pub fn get(&self) -> ConsumerStatus {
        *self.status.read()
    }

    pub fn is(&self, status: ConsumerStatus) -> bool {
        *self.status.read() == status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_only_applies_from_expected_state() {
        let metrics = Arc::new(Metrics::new("tests"));
        let status = StatusCell::new(metrics.clone());

        assert!(!status.transition(ConsumerStatus::Running, ConsumerStatus::Stopping));
        assert!(status.transition(ConsumerStatus::Starting, ConsumerStatus::Running));
        assert!(status.is(ConsumerStatus::Running));
        assert_eq!(metrics.status.with_label_values(&["RUNNING"]).get(), 1);
        assert_eq!(metrics.status.with_label_values(&["STARTING"]).get(), 0);
    }
}
