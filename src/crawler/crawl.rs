use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::browser::Browser;
use crate::crawler::lifecycle::{failure_code, TaskState};
use crate::crawler::pool::{next_item, SharedReceiver};
use crate::crawler::stats::TaskStats;
use crate::crawler::task::{RawResult, Task};

/// One crawl pool worker: pull sanitized tasks until the queue closes
pub async fn run_crawler(
    id: usize,
    browser: Arc<dyn Browser>,
    tasks: SharedReceiver<Task>,
    results: mpsc::Sender<RawResult>,
    cancel: CancellationToken,
) {
    while let Some(task) = next_item(&tasks).await {
        let result = crawl_task(browser.as_ref(), task, &cancel).await;
        if results.send(result).await.is_err() {
            warn!("Crawler {}: postprocess queue closed, stopping", id);
            return;
        }
    }
    debug!("Crawler {} finished", id);
}

/// Run one crawl attempt, folding any failure into the task
pub async fn crawl_task(browser: &dyn Browser, mut task: Task, cancel: &CancellationToken) -> RawResult {
    let mut stats = TaskStats::for_attempt(&task);
    stats.timing.begin_crawl = Some(Utc::now());

    debug!("Crawling {} (attempt {}/{})", task.url, task.current_attempt, task.max_attempts);

    let mut output = None;
    if cancel.is_cancelled() {
        task.fail(failure_code::CANCELLED);
    } else if let Err(e) = tokio::fs::create_dir_all(&task.working_dir).await {
        warn!("Failed to create working directory {}: {}", task.working_dir.display(), e);
        task.fail(failure_code::WORKING_DIR);
    } else {
        // The call itself runs inside the guarded future so a panic while
        // building it is caught as well
        let crawl = AssertUnwindSafe(async { browser.crawl(&task, &mut stats.timing).await }).catch_unwind();
        tokio::select! {
            crawled = crawl => match crawled {
                Ok(Ok(crawled)) => output = Some(crawled),
                Ok(Err(failure)) => {
                    warn!("Crawl of {} failed: {}", task.url, failure);
                    task.fail(failure.code);
                }
                Err(_) => {
                    error!("Browser panicked while crawling {}", task.url);
                    task.fail(failure_code::CRAWL_PANICKED);
                }
            },
            _ = cancel.cancelled() => task.fail(failure_code::CANCELLED),
        }
    }

    stats.timing.end_crawl = Some(Utc::now());

    if let Err(e) = task.advance(TaskState::Crawled) {
        warn!("{}", e);
    }

    let output = output.unwrap_or_default();
    RawResult {
        task,
        stats,
        resource_metadata: output.resource_metadata,
        script_metadata: output.script_metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{CrawlFailure, CrawlOutput, MockBrowser};
    use crate::crawler::stats::TaskTiming;
    use crate::crawler::task::StorageFlags;
    use serde_json::json;
    use tempfile::TempDir;

    fn task_in(dir: &TempDir) -> Task {
        Task {
            url: "https://example.com/".to_string(),
            output_path: "results".to_string(),
            working_dir: dir.path().join("abc"),
            random_identifier: "abc".to_string(),
            failed: false,
            failure_code: None,
            past_failure_codes: Vec::new(),
            current_attempt: 1,
            max_attempts: 2,
            storage: StorageFlags::default(),
            state: TaskState::Sanitized,
        }
    }

    #[tokio::test]
    async fn test_successful_crawl() {
        let dir = TempDir::new().unwrap();
        let mut browser = MockBrowser::new();
        browser.expect_crawl()
            .times(1)
            .returning(|_, _| Ok(CrawlOutput {
                resource_metadata: Some(json!({"0": {"url": "https://example.com/"}})),
                script_metadata: None,
            }));

        let result = crawl_task(&browser, task_in(&dir), &CancellationToken::new()).await;

        assert!(!result.task.failed);
        assert_eq!(result.task.state, TaskState::Crawled);
        assert!(result.resource_metadata.is_some());
        assert!(result.stats.timing.begin_crawl.is_some());
        assert!(result.stats.timing.end_crawl.is_some());
        assert!(dir.path().join("abc").is_dir());
    }

    #[tokio::test]
    async fn test_failure_code_recorded() {
        let dir = TempDir::new().unwrap();
        let mut browser = MockBrowser::new();
        browser.expect_crawl()
            .returning(|_, _| Err(CrawlFailure::new("PageLoadTimeout", "timed out")));

        let result = crawl_task(&browser, task_in(&dir), &CancellationToken::new()).await;

        assert!(result.task.failed);
        assert_eq!(result.task.failure_code.as_deref(), Some("PageLoadTimeout"));
        assert_eq!(result.task.state, TaskState::Crawled);
    }

    struct CrashingBrowser;

    #[async_trait::async_trait]
    impl Browser for CrashingBrowser {
        async fn crawl(&self, _task: &Task, _timing: &mut TaskTiming) -> Result<CrawlOutput, CrawlFailure> {
            panic!("renderer crashed");
        }
    }

    #[tokio::test]
    async fn test_browser_panic_becomes_failure() {
        let dir = TempDir::new().unwrap();
        let result = crawl_task(&CrashingBrowser, task_in(&dir), &CancellationToken::new()).await;

        assert!(result.task.failed);
        assert_eq!(result.task.failure_code.as_deref(), Some(failure_code::CRAWL_PANICKED));
        assert_eq!(result.task.state, TaskState::Crawled);
        assert!(result.stats.timing.end_crawl.is_some());
    }

    #[tokio::test]
    async fn test_cancelled_crawl_skips_browser() {
        let dir = TempDir::new().unwrap();
        let mut browser = MockBrowser::new();
        browser.expect_crawl().never();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = crawl_task(&browser, task_in(&dir), &cancel).await;

        assert!(result.task.failed);
        assert_eq!(result.task.failure_code.as_deref(), Some(failure_code::CANCELLED));
    }

    #[tokio::test]
    async fn test_unusable_working_dir_fails_task() {
        let dir = TempDir::new().unwrap();
        // A file where the working directory's parent should be
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let mut task = task_in(&dir);
        task.working_dir = blocker.join("abc");

        let mut browser = MockBrowser::new();
        browser.expect_crawl().never();

        let result = crawl_task(&browser, task, &CancellationToken::new()).await;
        assert_eq!(result.task.failure_code.as_deref(), Some(failure_code::WORKING_DIR));
    }
}
