use serde::{Serialize, Deserialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::crawler::lifecycle::TaskState;
use crate::crawler::stats::TaskStats;

fn default_true() -> bool {
    true
}

/// Which artifact categories should be persisted for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageFlags {
    /// Resource metadata collected during the crawl
    #[serde(default = "default_true")]
    pub resource_metadata: bool,

    /// Raw resources downloaded during the crawl (the `files/` directory)
    #[serde(default)]
    pub all_resources: bool,

    /// Metadata for every script parsed by the browser
    #[serde(default = "default_true")]
    pub script_metadata: bool,

    /// Raw script sources (the `scripts/` directory)
    #[serde(default)]
    pub all_scripts: bool,
}

impl Default for StorageFlags {
    fn default() -> Self {
        Self {
            resource_metadata: true,
            all_resources: false,
            script_metadata: true,
            all_scripts: false,
        }
    }
}

/// A task as produced by intake, before sanitization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTask {
    /// URL to visit
    pub url: String,

    /// Local path or remote URI the results should be written to
    #[serde(default)]
    pub output_path: Option<String>,

    /// Maximum number of attempts before the task is abandoned
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Artifact selection
    #[serde(flatten)]
    pub storage: StorageFlags,
}

impl RawTask {
    /// Create a raw task for a URL with default settings
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            output_path: None,
            max_attempts: None,
            storage: StorageFlags::default(),
        }
    }
}

/// Many URLs sharing the same settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedTask {
    pub urls: Vec<String>,

    #[serde(default)]
    pub output_path: Option<String>,

    #[serde(default)]
    pub max_attempts: Option<u32>,

    #[serde(flatten)]
    pub storage: StorageFlags,
}

impl CompressedTask {
    /// Expand into one raw task per URL
    pub fn expand(self) -> Vec<RawTask> {
        let Self { urls, output_path, max_attempts, storage } = self;
        urls.into_iter()
            .map(|url| RawTask {
                url,
                output_path: output_path.clone(),
                max_attempts,
                storage,
            })
            .collect()
    }
}

/// Accepted shapes of a task file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskFile {
    Many(Vec<RawTask>),
    Compressed(CompressedTask),
    Single(RawTask),
}

impl TaskFile {
    /// Flatten the file into individual raw tasks
    pub fn into_tasks(self) -> Vec<RawTask> {
        match self {
            Self::Many(tasks) => tasks,
            Self::Compressed(compressed) => compressed.expand(),
            Self::Single(task) => vec![task],
        }
    }
}

/// A sanitized task, owned by exactly one stage at a time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// URL to visit
    pub url: String,

    /// Local path or remote URI for results
    pub output_path: String,

    /// Directory for transient crawl artifacts
    pub working_dir: PathBuf,

    /// Unique random identifier, also the name of the output directory
    pub random_identifier: String,

    /// Set when the current attempt failed
    pub failed: bool,

    /// Why the current attempt failed
    pub failure_code: Option<String>,

    /// Failure codes of earlier attempts, oldest first
    pub past_failure_codes: Vec<String>,

    /// Attempt number, starting at 1
    pub current_attempt: u32,

    /// Attempts allowed before abandoning
    pub max_attempts: u32,

    /// Artifact selection
    pub storage: StorageFlags,

    /// Where the task is in its lifecycle
    pub state: TaskState,
}

impl Task {
    /// Mark the current attempt as failed
    pub fn fail(&mut self, code: impl Into<String>) {
        self.failed = true;
        self.failure_code = Some(code.into());
    }

    /// Every failure code seen so far, including the current one
    pub fn failure_history(&self) -> Vec<String> {
        let mut history = self.past_failure_codes.clone();
        if let Some(code) = &self.failure_code {
            history.push(code.clone());
        }
        history
    }
}

/// What a crawl attempt left behind, consumed once by postprocess
#[derive(Debug)]
pub struct RawResult {
    pub task: Task,
    pub stats: TaskStats,

    /// Resource metadata reported by the browser, if collected
    pub resource_metadata: Option<Value>,

    /// Script metadata reported by the browser, if collected
    pub script_metadata: Option<Value>,
}

/// A validated result, consumed once by storage
#[derive(Debug)]
pub struct FinalResult {
    pub task: Task,
    pub stats: TaskStats,
    pub resource_metadata: Value,
    pub script_metadata: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_file_shapes() {
        let single: TaskFile = serde_json::from_str(r#"{"url": "example.com"}"#).unwrap();
        assert_eq!(single.into_tasks().len(), 1);

        let many: TaskFile = serde_json::from_str(
            r#"[{"url": "a.com"}, {"url": "b.com", "max_attempts": 4}]"#,
        ).unwrap();
        let tasks = many.into_tasks();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].max_attempts, Some(4));

        let compressed: TaskFile = serde_json::from_str(
            r#"{"urls": ["a.com", "b.com", "c.com"], "all_scripts": true, "output_path": "out"}"#,
        ).unwrap();
        let tasks = compressed.into_tasks();
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.storage.all_scripts));
        assert!(tasks.iter().all(|t| t.output_path.as_deref() == Some("out")));
    }

    #[test]
    fn test_storage_flag_defaults() {
        let task: RawTask = serde_json::from_str(r#"{"url": "example.com"}"#).unwrap();
        assert!(task.storage.resource_metadata);
        assert!(task.storage.script_metadata);
        assert!(!task.storage.all_resources);
        assert!(!task.storage.all_scripts);
    }
}
