pub mod error;
pub mod metrics;
pub mod status;

pub use error::HandlerError;
pub use metrics::Metrics;
pub use status::{ConsumerStatus, StatusCell};
