pub mod crawl;
pub mod inflight;
pub mod intake;
pub mod lifecycle;
pub mod pipeline;
pub mod pool;
pub mod postprocess;
pub mod sanitize;
pub mod stats;
pub mod task;

// Re-export common types
pub use inflight::InFlight;
pub use pipeline::{Pipeline, PipelineReport};
pub use task::{RawTask, Task};
