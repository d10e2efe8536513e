pub mod config;
pub mod kafka;
pub mod stream;
pub mod telemetry;
pub mod util;
