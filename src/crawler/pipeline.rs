//! Pipeline orchestration
//!
//! Stages are started downstream first (storage, postprocess, crawl,
//! sanitize, intake) so no stage ever waits on a consumer that is not
//! running yet. Shutdown follows the data:
//!
//! 1. sanitize closes the crawl queue once intake is exhausted *and* the
//!    in-flight count is zero, so retries can still re-enter until then;
//! 2. the crawl pool barrier is awaited before the postprocess queue is
//!    closed;
//! 3. the storage pool barrier is the final drain signal, after which the
//!    temporary root, the monitoring sink and remote connections are torn
//!    down.

use anyhow::{Result, Context};
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::browser::Browser;
use crate::cli::config::{ConfigError, CrawlerConfig};
use crate::crawler::crawl::run_crawler;
use crate::crawler::inflight::InFlight;
use crate::crawler::intake::{run_intake, TaskSource};
use crate::crawler::pool::{shared, WorkerPool};
use crate::crawler::postprocess::run_postprocessor;
use crate::crawler::sanitize::{run_sanitizer, Sanitizer};
use crate::storage::analytics::StatsRecorder;
use crate::storage::registry::RemoteConnector;
use crate::storage::{Backoff, ConnectionRegistry, SshConnector, StorageStage};
use crate::utils::monitor::Monitor;

/// What happened to the tasks of one pipeline run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineReport {
    /// Raw tasks produced by intake
    pub submitted: usize,
    /// Tasks that completed successfully
    pub stored: usize,
    /// Retry attempts scheduled
    pub retried: usize,
    /// Tasks that failed for the last time
    pub abandoned: usize,
    /// Raw tasks that failed sanitization
    pub rejected: usize,
}

impl PipelineReport {
    /// Tasks that reached a terminal disposition
    pub fn finished(&self) -> usize {
        self.stored + self.abandoned
    }
}

pub struct Pipeline {
    config: CrawlerConfig,
    browser: Arc<dyn Browser>,
    connector: Arc<dyn RemoteConnector>,
    analytics: Option<Arc<dyn StatsRecorder>>,
    inflight: InFlight,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Build a pipeline, rejecting invalid configuration before anything starts
    pub fn new(config: CrawlerConfig, browser: Arc<dyn Browser>) -> Result<Self, ConfigError> {
        config.validate()?;
        let connector = Arc::new(SshConnector::new(&config.remote));

        Ok(Self {
            config,
            browser,
            connector,
            analytics: None,
            inflight: InFlight::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Use a different remote storage connector
    pub fn with_connector(mut self, connector: Arc<dyn RemoteConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_analytics(mut self, recorder: Arc<dyn StatsRecorder>) -> Self {
        self.analytics = Some(recorder);
        self
    }

    /// Token that cancels this pipeline
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn inflight(&self) -> InFlight {
        self.inflight.clone()
    }

    /// Run every task from `source` to completion or abandonment
    pub async fn run(self, mut source: Box<dyn TaskSource>) -> Result<PipelineReport> {
        let Self { config, browser, connector, analytics, inflight, cancel } = self;
        let settings = &config.pipeline;
        let capacity = settings.queue_capacity;

        info!(
            "Starting pipeline with {} crawlers and {} storage workers",
            settings.crawlers, settings.storers
        );

        let (raw_tx, raw_rx) = mpsc::channel(capacity);
        let (sanitized_tx, sanitized_rx) = mpsc::channel(capacity);
        let (crawled_tx, crawled_rx) = mpsc::channel(capacity);
        let (final_tx, final_rx) = mpsc::channel(capacity);
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();

        let mut monitor = None;
        let mut stats_tx = None;
        if config.monitoring.enabled {
            let (started, tx) = Monitor::start(&config.monitoring).await?;
            monitor = Some(started);
            stats_tx = Some(tx);
        }

        let backoff = Backoff::from_settings(&config.remote);
        let registry = Arc::new(ConnectionRegistry::new(connector, backoff));

        let mut stage = StorageStage::new(registry.clone(), backoff, retry_tx, inflight.clone(), cancel.clone())
            .retry_on_storage_error(settings.retry_on_storage_error);
        if let Some(tx) = stats_tx {
            stage = stage.with_monitoring(tx);
        }
        if let Some(recorder) = analytics {
            stage = stage.with_analytics(recorder);
        }
        let tally = stage.tally();

        let final_rx = shared(final_rx);
        let storage_pool = WorkerPool::spawn("storage", settings.storers, |i| {
            stage.clone().run_worker(i, final_rx.clone())
        });
        // Workers own the remaining senders of the retry and stats queues
        drop(stage);

        let postprocessor = tokio::spawn(run_postprocessor(crawled_rx, final_tx));

        let sanitized_rx = shared(sanitized_rx);
        let crawl_pool = WorkerPool::spawn("crawl", settings.crawlers, |i| {
            run_crawler(i, browser.clone(), sanitized_rx.clone(), crawled_tx.clone(), cancel.clone())
        });

        let sanitizer = tokio::spawn(run_sanitizer(
            Sanitizer::new(settings),
            raw_rx,
            retry_rx,
            sanitized_tx,
            inflight.clone(),
            cancel.clone(),
        ));

        let intake = {
            let cancel = cancel.clone();
            tokio::spawn(async move { run_intake(source.as_mut(), raw_tx, cancel).await })
        };

        crawl_pool.join().await;
        drop(crawled_tx);
        debug!("Crawl pool drained, postprocess queue closed");

        postprocessor.await.context("Postprocess worker terminated abnormally")?;
        storage_pool.join().await;
        debug!("Storage pool drained");

        let submitted = intake.await.context("Intake worker terminated abnormally")?;
        let sanitized = sanitizer.await.context("Sanitize worker terminated abnormally")?;

        match tokio::fs::remove_dir_all(&settings.temp_dir).await {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                warn!("Failed to remove temporary directory {}: {}", settings.temp_dir.display(), e);
            }
            _ => {}
        }

        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        registry.close_all().await;

        let report = PipelineReport {
            submitted,
            stored: tally.stored(),
            retried: tally.retried(),
            abandoned: tally.abandoned(),
            rejected: sanitized.rejected,
        };

        if inflight.current() != 0 {
            warn!("Pipeline finished with {} tasks still counted in flight", inflight.current());
        }
        info!(
            "Pipeline finished: {} submitted, {} stored, {} retried, {} abandoned, {} rejected",
            report.submitted, report.stored, report.retried, report.abandoned, report.rejected
        );

        Ok(report)
    }
}
