//! The storage stage and the retry router embedded in it
//!
//! Each worker persists a final result, removes the task's working
//! directory, then decides between completion, retry and abandonment. A retry
//! is counted in flight *before* the task is handed back to the sanitize
//! stage, and every result closes out exactly one in-flight slot.

use chrono::Utc;
use futures::FutureExt;
use std::io::ErrorKind;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crawler::inflight::InFlight;
use crate::crawler::lifecycle::{failure_code, Disposition, TaskState};
use crate::crawler::pool::{next_item, SharedReceiver};
use crate::crawler::stats::TaskStats;
use crate::crawler::task::{FinalResult, Task};
use crate::storage::analytics::StatsRecorder;
use crate::storage::backoff::Backoff;
use crate::storage::local::store_results_local;
use crate::storage::registry::ConnectionRegistry;
use crate::storage::remote::RemoteHost;
use crate::storage::{dir_name_from_url, Destination, StorageError};

/// Delay before the second attempt at removing a working directory
pub const CLEANUP_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Directory inside the working directory where remote uploads are staged
const UPLOAD_STAGING_DIR: &str = "upload";

/// The working directory could not be removed, even on the second try
#[derive(Debug, Error)]
#[error("Failed to remove working directory {path}: {source}")]
pub struct CleanupError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Outcome counts across every storage worker
#[derive(Debug, Default)]
pub struct StorageTally {
    stored: AtomicUsize,
    retried: AtomicUsize,
    abandoned: AtomicUsize,
}

impl StorageTally {
    pub fn stored(&self) -> usize {
        self.stored.load(Ordering::SeqCst)
    }

    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }
}

/// Shared state and collaborators of the storage workers
#[derive(Clone)]
pub struct StorageStage {
    registry: Arc<ConnectionRegistry>,
    backoff: Backoff,
    retry_tx: mpsc::UnboundedSender<Task>,
    inflight: InFlight,
    cancel: CancellationToken,
    stats_tx: Option<mpsc::Sender<TaskStats>>,
    analytics: Option<Arc<dyn StatsRecorder>>,
    retry_on_storage_error: bool,
    cleanup_delay: Duration,
    tally: Arc<StorageTally>,
}

impl StorageStage {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        backoff: Backoff,
        retry_tx: mpsc::UnboundedSender<Task>,
        inflight: InFlight,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            backoff,
            retry_tx,
            inflight,
            cancel,
            stats_tx: None,
            analytics: None,
            retry_on_storage_error: false,
            cleanup_delay: CLEANUP_RETRY_DELAY,
            tally: Arc::new(StorageTally::default()),
        }
    }

    /// Send each attempt's stats to the monitoring sink
    pub fn with_monitoring(mut self, stats_tx: mpsc::Sender<TaskStats>) -> Self {
        self.stats_tx = Some(stats_tx);
        self
    }

    pub fn with_analytics(mut self, recorder: Arc<dyn StatsRecorder>) -> Self {
        self.analytics = Some(recorder);
        self
    }

    /// Treat storage errors as attempt failures instead of only logging them
    pub fn retry_on_storage_error(mut self, enabled: bool) -> Self {
        self.retry_on_storage_error = enabled;
        self
    }

    pub fn with_cleanup_delay(mut self, delay: Duration) -> Self {
        self.cleanup_delay = delay;
        self
    }

    pub fn tally(&self) -> Arc<StorageTally> {
        self.tally.clone()
    }

    /// One storage pool worker: handle final results until the queue closes
    ///
    /// A panic while handling one result drops that task and the worker
    /// moves on to the next one.
    pub async fn run_worker(self, id: usize, results: SharedReceiver<FinalResult>) {
        while let Some(result) = next_item(&results).await {
            let url = result.task.url.clone();
            if AssertUnwindSafe(self.handle(result)).catch_unwind().await.is_err() {
                error!("Storage worker {} panicked while handling {}, task dropped", id, url);
            }
        }
        debug!("Storage worker {} finished", id);
    }

    /// Store, clean up and dispose of one final result
    pub async fn handle(&self, mut result: FinalResult) {
        let mut slot = AttemptSlot::new(&self.inflight, &self.tally);
        result.stats.timing.begin_storage = Some(Utc::now());

        if let Err(e) = result.task.advance(TaskState::Stored) {
            warn!("{}", e);
        }

        if !result.task.failed {
            match self.store(&result).await {
                Ok(()) => {}
                Err(StorageError::Cancelled) => {
                    warn!("Storage of {} cancelled", result.task.url);
                    result.task.fail(failure_code::CANCELLED);
                }
                Err(e) => {
                    error!("Failed to store results for {}: {}", result.task.url, e);
                    if self.retry_on_storage_error {
                        result.task.fail(failure_code::STORAGE);
                    }
                }
            }
        }

        let FinalResult { mut task, mut stats, .. } = result;
        stats.task_succeeded = !task.failed;
        stats.failure_code = task.failure_code.clone();

        let disposition = match self.remove_working_dir(&task.working_dir).await {
            Err(e) => {
                error!(url = %task.url, "{}", e);
                task.abandon()
            }
            Ok(()) if task.failure_code.as_deref() == Some(failure_code::CANCELLED) => task.abandon(),
            Ok(()) => task.resolve(),
        };

        match disposition {
            Ok(Disposition::Completed) => {
                self.tally.stored.fetch_add(1, Ordering::SeqCst);
                info!("Completed {} (attempt {})", task.url, task.current_attempt);
            }
            Ok(Disposition::Retry) => {
                self.tally.retried.fetch_add(1, Ordering::SeqCst);
                debug!("Retrying {} (attempt {}/{})", task.url, task.current_attempt, task.max_attempts);
                self.reinject(task);
            }
            Ok(Disposition::Abandoned { failure_codes }) => {
                self.tally.abandoned.fetch_add(1, Ordering::SeqCst);
                error!(
                    url = %task.url,
                    "Task abandoned after {} attempts. Failure codes: [ {} ]",
                    task.current_attempt,
                    failure_codes.join(", ")
                );
            }
            Err(e) => {
                self.tally.abandoned.fetch_add(1, Ordering::SeqCst);
                error!(url = %task.url, "Dropping task: {}", e);
            }
        }
        slot.disposed = true;

        stats.timing.end_storage = Some(Utc::now());

        if let Some(analytics) = &self.analytics {
            if let Err(e) = analytics.record(&stats).await {
                warn!("Failed to record analytics for {}: {:#}", stats.url, e);
            }
        }

        if let Some(stats_tx) = &self.stats_tx {
            if stats_tx.send(stats).await.is_err() {
                debug!("Monitoring sink closed, stats dropped");
            }
        }
    }

    /// Hand a task back to the front of the pipeline
    fn reinject(&self, task: Task) {
        // Count the new attempt before it leaves this worker
        self.inflight.add();
        if let Err(returned) = self.retry_tx.send(task) {
            error!("Retry path closed, dropping {}", returned.0.url);
            self.inflight.done();
        }
    }

    async fn store(&self, result: &FinalResult) -> Result<(), StorageError> {
        let task = &result.task;
        let dir_name = dir_name_from_url(&task.url)?;

        match Destination::parse(&task.output_path)? {
            Destination::Local(root) => {
                let outpath = root.join(dir_name).join(&task.random_identifier);
                store_results_local(result, &outpath).await
            }
            Destination::Remote(host) => self.store_remote(result, &host, &dir_name).await,
        }
    }

    /// Stage the result locally, then upload it over the host's connection
    async fn store_remote(&self, result: &FinalResult, host: &RemoteHost, dir_name: &str) -> Result<(), StorageError> {
        let task = &result.task;
        let staged = task.working_dir.join(UPLOAD_STAGING_DIR).join(&task.random_identifier);
        store_results_local(result, &staged).await?;

        let remote_parent = format!("{}/{}", host.path.trim_end_matches('/'), dir_name);

        let entry = self.registry.acquire(host, &self.cancel).await?;
        let conn = entry.lock().await;
        let what = format!("Upload of {} to {}", task.random_identifier, host.key());
        self.backoff
            .retry_forever(&what, &self.cancel, || conn.upload(&staged, &remote_parent))
            .await?;

        debug!("Stored results for {} on {}:{}", task.url, entry.host().key(), remote_parent);
        Ok(())
    }

    /// Delete the working directory, retrying once after a delay
    async fn remove_working_dir(&self, dir: &Path) -> Result<(), CleanupError> {
        let first = match remove_dir_if_present(dir).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        warn!("Failed to remove {} ({}), retrying in {:?}", dir.display(), first, self.cleanup_delay);
        tokio::time::sleep(self.cleanup_delay).await;

        match remove_dir_if_present(dir).await {
            Ok(()) => {
                info!("Removed {} on second try", dir.display());
                Ok(())
            }
            Err(source) => Err(CleanupError { path: dir.to_path_buf(), source }),
        }
    }
}

/// The in-flight slot of the attempt being stored
///
/// Dropping it closes the slot, so an attempt that unwinds out of the storage
/// worker is still accounted for, as abandoned if it never reached a
/// disposition.
struct AttemptSlot<'a> {
    inflight: &'a InFlight,
    tally: &'a StorageTally,
    disposed: bool,
}

impl<'a> AttemptSlot<'a> {
    fn new(inflight: &'a InFlight, tally: &'a StorageTally) -> Self {
        Self { inflight, tally, disposed: false }
    }
}

impl Drop for AttemptSlot<'_> {
    fn drop(&mut self) {
        if !self.disposed {
            self.tally.abandoned.fetch_add(1, Ordering::SeqCst);
        }
        self.inflight.done();
    }
}

async fn remove_dir_if_present(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::SCRIPTS_SUBDIR;
    use crate::crawler::pool::shared;
    use crate::crawler::task::StorageFlags;
    use crate::storage::analytics::MockStatsRecorder;
    use crate::storage::registry::{RemoteConnection, RemoteConnector};
    use crate::storage::RESOURCE_METADATA_FILE;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Harness {
        stage: StorageStage,
        retry_rx: mpsc::UnboundedReceiver<Task>,
        inflight: InFlight,
    }

    fn harness_with(connector: Arc<dyn RemoteConnector>) -> Harness {
        let backoff = Backoff::new(Duration::from_millis(10), 2);
        let registry = Arc::new(ConnectionRegistry::new(connector, backoff));
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let inflight = InFlight::new();
        let stage = StorageStage::new(registry, backoff, retry_tx, inflight.clone(), CancellationToken::new())
            .with_cleanup_delay(Duration::from_millis(10));
        Harness { stage, retry_rx, inflight }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(RecordingConnector::default()))
    }

    fn final_result(work: &TempDir, output_path: &str) -> FinalResult {
        let working_dir = work.path().join("abc");
        std::fs::create_dir_all(&working_dir).unwrap();
        let task = Task {
            url: "https://example.com/page".to_string(),
            output_path: output_path.to_string(),
            working_dir,
            random_identifier: "abc".to_string(),
            failed: false,
            failure_code: None,
            past_failure_codes: Vec::new(),
            current_attempt: 1,
            max_attempts: 2,
            storage: StorageFlags::default(),
            state: TaskState::Postprocessed,
        };
        FinalResult {
            stats: TaskStats::for_attempt(&task),
            task,
            resource_metadata: json!({"0": {"url": "https://example.com/page"}}),
            script_metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn test_successful_result_stored_locally() {
        let work = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let (stats_tx, mut stats_rx) = mpsc::channel(4);
        let mut h = harness();
        h.stage = h.stage.with_monitoring(stats_tx);
        h.inflight.add();

        let result = final_result(&work, out.path().to_str().unwrap());
        let working_dir = result.task.working_dir.clone();
        h.stage.handle(result).await;

        assert!(out.path().join("example.com").join("abc").join(RESOURCE_METADATA_FILE).is_file());
        assert!(!working_dir.exists());
        assert_eq!(h.inflight.current(), 0);
        assert_eq!(h.stage.tally().stored(), 1);
        assert!(h.retry_rx.try_recv().is_err());

        let stats = stats_rx.recv().await.unwrap();
        assert!(stats.task_succeeded);
        assert!(stats.timing.begin_storage.is_some());
        assert!(stats.timing.end_storage >= stats.timing.begin_storage);
    }

    #[tokio::test]
    async fn test_failed_task_is_reinjected() {
        let work = TempDir::new().unwrap();
        let mut h = harness();
        h.inflight.add();

        let mut result = final_result(&work, "unused");
        result.task.fail("PageLoadTimeout");
        h.stage.handle(result).await;

        let retried = h.retry_rx.try_recv().unwrap();
        assert_eq!(retried.state, TaskState::Retrying);
        assert_eq!(retried.current_attempt, 2);
        assert!(!retried.failed);
        assert_eq!(retried.past_failure_codes, vec!["PageLoadTimeout".to_string()]);

        // The old attempt closed out, the new one is counted
        assert_eq!(h.inflight.current(), 1);
        assert_eq!(h.stage.tally().retried(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_task_is_abandoned() {
        let work = TempDir::new().unwrap();
        let mut h = harness();
        h.inflight.add();

        let mut result = final_result(&work, "unused");
        result.task.current_attempt = 2;
        result.task.past_failure_codes = vec!["PageLoadTimeout".to_string()];
        result.task.fail("PageLoadTimeout");
        h.stage.handle(result).await;

        assert!(h.retry_rx.try_recv().is_err());
        assert_eq!(h.inflight.current(), 0);
        assert_eq!(h.stage.tally().abandoned(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_task_not_retried() {
        let work = TempDir::new().unwrap();
        let mut h = harness();
        h.inflight.add();

        let mut result = final_result(&work, "unused");
        result.task.fail(failure_code::CANCELLED);
        h.stage.handle(result).await;

        assert!(h.retry_rx.try_recv().is_err());
        assert_eq!(h.stage.tally().abandoned(), 1);
        assert_eq!(h.inflight.current(), 0);
    }

    #[tokio::test]
    async fn test_storage_error_swallowed_by_default() {
        let work = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::create_dir_all(out.path().join("example.com").join("abc")).unwrap();
        let mut h = harness();
        h.inflight.add();

        h.stage.handle(final_result(&work, out.path().to_str().unwrap())).await;

        assert!(h.retry_rx.try_recv().is_err());
        assert_eq!(h.stage.tally().stored(), 1);
        assert_eq!(h.inflight.current(), 0);
    }

    #[tokio::test]
    async fn test_storage_error_retried_when_enabled() {
        let work = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::create_dir_all(out.path().join("example.com").join("abc")).unwrap();
        let mut h = harness();
        h.stage = h.stage.retry_on_storage_error(true);
        h.inflight.add();

        h.stage.handle(final_result(&work, out.path().to_str().unwrap())).await;

        let retried = h.retry_rx.try_recv().unwrap();
        assert_eq!(retried.past_failure_codes, vec![failure_code::STORAGE.to_string()]);
        assert_eq!(h.inflight.current(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_failure_abandons_task() {
        let work = TempDir::new().unwrap();
        let mut h = harness();
        h.inflight.add();

        let mut result = final_result(&work, "unused");
        // A working directory below a regular file can never be removed
        let blocker = work.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        result.task.working_dir = blocker.join("abc");
        result.task.fail("PageLoadTimeout");

        h.stage.handle(result).await;

        assert!(h.retry_rx.try_recv().is_err());
        assert_eq!(h.stage.tally().abandoned(), 1);
        assert_eq!(h.inflight.current(), 0);
    }

    #[tokio::test]
    async fn test_analytics_recorded_once_per_attempt() {
        let work = TempDir::new().unwrap();
        let mut recorder = MockStatsRecorder::new();
        recorder.expect_record()
            .times(1)
            .withf(|stats| !stats.task_succeeded && stats.failure_code.as_deref() == Some("PageLoadTimeout"))
            .returning(|_| Ok(()));

        let mut h = harness();
        h.stage = h.stage.with_analytics(Arc::new(recorder));
        h.inflight.add();

        let mut result = final_result(&work, "unused");
        result.task.fail("PageLoadTimeout");
        h.stage.handle(result).await;
    }

    struct ExplodingRecorder;

    #[async_trait]
    impl StatsRecorder for ExplodingRecorder {
        async fn record(&self, _stats: &TaskStats) -> anyhow::Result<()> {
            panic!("analytics backend exploded");
        }
    }

    #[tokio::test]
    async fn test_worker_survives_panic_while_handling() {
        let work = TempDir::new().unwrap();
        let mut h = harness();
        h.stage = h.stage.with_analytics(Arc::new(ExplodingRecorder));

        let (tx, rx) = mpsc::channel(2);
        for _ in 0..2 {
            let mut result = final_result(&work, "unused");
            result.task.current_attempt = 2;
            result.task.fail("PageLoadTimeout");
            h.inflight.add();
            tx.send(result).await.unwrap();
        }
        drop(tx);

        tokio::time::timeout(Duration::from_secs(5), h.stage.clone().run_worker(0, shared(rx)))
            .await
            .expect("worker should keep draining after a panic");

        assert_eq!(h.inflight.current(), 0);
        assert_eq!(h.stage.tally().abandoned(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_storage_retry_recovers_from_partial_store() {
        let work = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let results = out.path().join("results");
        let mut h = harness();
        h.stage = h.stage.retry_on_storage_error(true);
        h.inflight.add();

        // The results root first resolves inside the scripts directory, so
        // moving the scripts fails after metadata was already written
        let mut result = final_result(&work, results.to_str().unwrap());
        result.task.storage.all_scripts = true;
        let scripts = result.task.working_dir.join(SCRIPTS_SUBDIR);
        std::fs::create_dir_all(scripts.join("nested")).unwrap();
        std::os::unix::fs::symlink(scripts.join("nested"), &results).unwrap();

        h.stage.handle(result).await;

        let mut retried = h.retry_rx.try_recv().unwrap();
        assert_eq!(retried.past_failure_codes, vec![failure_code::STORAGE.to_string()]);

        // Second attempt against a healthy results root
        std::fs::remove_file(&results).unwrap();
        std::fs::create_dir_all(retried.working_dir.join(SCRIPTS_SUBDIR)).unwrap();
        for state in [TaskState::Sanitized, TaskState::Crawled, TaskState::Postprocessed] {
            retried.advance(state).unwrap();
        }
        let stats = TaskStats::for_attempt(&retried);
        h.stage.handle(FinalResult {
            task: retried,
            stats,
            resource_metadata: json!({}),
            script_metadata: json!({}),
        }).await;

        let outpath = results.join("example.com").join("abc");
        assert!(outpath.join(SCRIPTS_SUBDIR).is_dir());
        assert!(outpath.join(RESOURCE_METADATA_FILE).is_file());
        assert_eq!(h.stage.tally().stored(), 1);
        assert_eq!(h.stage.tally().abandoned(), 0);
        assert_eq!(h.inflight.current(), 0);
    }

    #[derive(Default)]
    struct RecordingConnector {
        uploads: Arc<Mutex<Vec<(PathBuf, String, bool)>>>,
        connects: AtomicUsize,
    }

    struct RecordingConnection {
        uploads: Arc<Mutex<Vec<(PathBuf, String, bool)>>>,
    }

    #[async_trait]
    impl RemoteConnection for RecordingConnection {
        async fn upload(&self, local_dir: &Path, remote_parent: &str) -> Result<(), StorageError> {
            let staged_metadata = local_dir.join(RESOURCE_METADATA_FILE).is_file();
            self.uploads.lock().unwrap().push((local_dir.to_path_buf(), remote_parent.to_string(), staged_metadata));
            Ok(())
        }

        async fn close(&self) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteConnector for RecordingConnector {
        async fn connect(&self, _host: &RemoteHost) -> Result<Box<dyn RemoteConnection>, StorageError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(RecordingConnection { uploads: self.uploads.clone() }))
        }
    }

    #[tokio::test]
    async fn test_remote_results_staged_then_uploaded() {
        let work = TempDir::new().unwrap();
        let connector = Arc::new(RecordingConnector::default());
        let h = harness_with(connector.clone());
        h.inflight.add();
        h.inflight.add();

        h.stage.handle(final_result(&work, "ssh://crawler@storage.example.com/srv/results")).await;
        h.stage.handle(final_result(&work, "ssh://crawler@storage.example.com/srv/results")).await;

        let uploads = connector.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 2);
        let (local, remote_parent, staged_metadata) = &uploads[0];
        assert!(local.ends_with("abc/upload/abc"));
        assert_eq!(remote_parent, "/srv/results/example.com");
        assert!(staged_metadata);

        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(h.stage.tally().stored(), 2);
        assert_eq!(h.inflight.current(), 0);
    }
}
