pub use self::metrics::serve_metrics;

mod metrics;
