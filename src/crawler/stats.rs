use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::crawler::task::Task;

/// Phase timestamps for a single crawl attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskTiming {
    pub begin_crawl: Option<DateTime<Utc>>,
    pub browser_open: Option<DateTime<Utc>>,
    pub connection_established: Option<DateTime<Utc>>,
    pub load_event: Option<DateTime<Utc>>,
    pub dom_content_event: Option<DateTime<Utc>>,
    pub browser_close: Option<DateTime<Utc>>,
    pub end_crawl: Option<DateTime<Utc>>,
    pub begin_postprocess: Option<DateTime<Utc>>,
    pub end_postprocess: Option<DateTime<Utc>>,
    pub begin_storage: Option<DateTime<Utc>>,
    pub end_storage: Option<DateTime<Utc>>,
}

/// Statistics from one attempt of one task, consumed by monitoring
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub task_succeeded: bool,
    pub url: String,
    pub random_identifier: String,
    pub attempt: u32,
    pub failure_code: Option<String>,
    pub timing: TaskTiming,

    /// Size of the raw JavaScript trace in bytes
    pub raw_trace_size: u64,
}

impl TaskStats {
    /// Start a stats record for the task's current attempt
    pub fn for_attempt(task: &Task) -> Self {
        Self {
            url: task.url.clone(),
            random_identifier: task.random_identifier.clone(),
            attempt: task.current_attempt,
            ..Default::default()
        }
    }

    /// Seconds from the start of the crawl to the end of storage
    pub fn total_duration_secs(&self) -> Option<f64> {
        let begin = self.timing.begin_crawl?;
        let end = self.timing.end_storage?;
        Some((end - begin).num_milliseconds() as f64 / 1000.0)
    }
}
