pub mod logging;
pub mod metrics;
pub mod monitor;

// Re-export common functions and types
pub use logging::{init_logging, default_log_file};
pub use metrics::{MetricsCollector, Metrics};
pub use monitor::Monitor;
