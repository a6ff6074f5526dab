use anyhow::{Result, Context};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crawler::task::{RawTask, TaskFile};
use crate::storage::queue::TaskQueue;

/// A producer of raw tasks
///
/// Yields zero or more tasks and then `Ok(None)` to signal exhaustion.
#[async_trait]
pub trait TaskSource: Send {
    async fn next_task(&mut self) -> Result<Option<RawTask>>;
}

/// Tasks read up front from a JSON task file
pub struct FileTaskSource {
    tasks: VecDeque<RawTask>,
}

impl FileTaskSource {
    /// Read and parse a task file
    pub fn open(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .context(format!("Failed to read task file: {}", path.display()))?;

        let file: TaskFile = serde_json::from_str(&contents)
            .context(format!("Failed to parse task file: {}", path.display()))?;

        let tasks = file.into_tasks();
        info!("Loaded {} tasks from {}", tasks.len(), path.display());

        Ok(Self::from_tasks(tasks))
    }

    pub fn from_tasks(tasks: Vec<RawTask>) -> Self {
        Self { tasks: tasks.into() }
    }

    /// Number of tasks not yet handed out
    pub fn remaining(&self) -> usize {
        self.tasks.len()
    }
}

#[async_trait]
impl TaskSource for FileTaskSource {
    async fn next_task(&mut self) -> Result<Option<RawTask>> {
        Ok(self.tasks.pop_front())
    }
}

/// Tasks consumed from a Redis list
pub struct QueueTaskSource {
    queue: TaskQueue,
    exit_when_empty: bool,
}

impl QueueTaskSource {
    pub fn new(queue: TaskQueue, exit_when_empty: bool) -> Self {
        Self { queue, exit_when_empty }
    }
}

#[async_trait]
impl TaskSource for QueueTaskSource {
    async fn next_task(&mut self) -> Result<Option<RawTask>> {
        loop {
            if let Some(task) = self.queue.pop_task().await? {
                return Ok(Some(task));
            }
            if self.exit_when_empty {
                debug!("Task queue empty, ending intake");
                return Ok(None);
            }
        }
    }
}

/// The intake stage worker
///
/// Feeds raw tasks into the sanitize queue until the source is exhausted,
/// fails, or the pipeline is cancelled. Dropping `raw_tx` on return signals
/// exhaustion downstream. Returns the number of tasks submitted.
pub async fn run_intake<S: TaskSource + ?Sized>(
    source: &mut S,
    raw_tx: mpsc::Sender<RawTask>,
    cancel: CancellationToken,
) -> usize {
    let mut submitted = 0;

    loop {
        let next = tokio::select! {
            next = source.next_task() => next,
            _ = cancel.cancelled() => {
                debug!("Intake cancelled after {} tasks", submitted);
                break;
            }
        };

        let task = match next {
            Ok(Some(task)) => task,
            Ok(None) => break,
            Err(e) => {
                warn!("Task source failed, ending intake: {:#}", e);
                break;
            }
        };

        tokio::select! {
            sent = raw_tx.send(task) => {
                if sent.is_err() {
                    warn!("Sanitize queue closed, ending intake");
                    break;
                }
                submitted += 1;
            }
            _ = cancel.cancelled() => break,
        }
    }

    debug!("Intake finished: {} tasks submitted", submitted);
    submitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_file_source_expands_compressed_tasks() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"urls": ["a.com", "b.com"], "max_attempts": 3}}"#).unwrap();

        let mut source = FileTaskSource::open(file.path()).unwrap();
        assert_eq!(source.remaining(), 2);

        let first = source.next_task().await.unwrap().unwrap();
        assert_eq!(first.url, "a.com");
        assert_eq!(first.max_attempts, Some(3));
        assert!(source.next_task().await.unwrap().is_some());
        assert!(source.next_task().await.unwrap().is_none());
    }

    #[test]
    fn test_unparseable_task_file_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(FileTaskSource::open(file.path()).is_err());
    }

    #[tokio::test]
    async fn test_intake_submits_all_then_closes() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut source = FileTaskSource::from_tasks(vec![
            RawTask::new("a.com"),
            RawTask::new("b.com"),
            RawTask::new("c.com"),
        ]);

        let submitted = run_intake(&mut source, tx, CancellationToken::new()).await;
        assert_eq!(submitted, 3);

        let mut urls = Vec::new();
        while let Some(task) = rx.recv().await {
            urls.push(task.url);
        }
        assert_eq!(urls, vec!["a.com", "b.com", "c.com"]);
    }

    #[tokio::test]
    async fn test_intake_stops_when_cancelled() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut source = FileTaskSource::from_tasks(vec![
            RawTask::new("a.com"),
            RawTask::new("b.com"),
            RawTask::new("c.com"),
        ]);
        let cancel = CancellationToken::new();

        let worker = {
            let cancel = cancel.clone();
            tokio::spawn(async move { run_intake(&mut source, tx, cancel).await })
        };

        assert_eq!(rx.recv().await.unwrap().url, "a.com");

        // b.com fills the queue again and c.com blocks on send
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();

        let submitted = worker.await.unwrap();
        assert_eq!(submitted, 2);
        assert_eq!(rx.recv().await.unwrap().url, "b.com");
        assert!(rx.recv().await.is_none());
    }
}
