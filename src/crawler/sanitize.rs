use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::cli::config::PipelineSettings;
use crate::crawler::inflight::InFlight;
use crate::crawler::lifecycle::TaskState;
use crate::crawler::task::{RawTask, Task};

/// Length of the random identifier given to every task
pub const IDENTIFIER_LEN: usize = 16;

/// Reasons a raw task is rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("Empty URL")]
    EmptyUrl,

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("URL has no host: {0}")]
    MissingHost(String),

    #[error("Empty output path")]
    EmptyOutputPath,
}

/// Turns raw tasks into tasks the rest of the pipeline can trust
#[derive(Debug, Clone)]
pub struct Sanitizer {
    default_output_path: String,
    default_max_attempts: u32,
    temp_dir: PathBuf,
}

impl Sanitizer {
    pub fn new(settings: &PipelineSettings) -> Self {
        Self {
            default_output_path: settings.output_path.clone(),
            default_max_attempts: settings.default_max_attempts,
            temp_dir: settings.temp_dir.clone(),
        }
    }

    /// Validate and fill in a raw task
    pub fn sanitize(&self, raw: RawTask) -> Result<Task, SanitizeError> {
        let url = normalize_url(&raw.url)?;

        let output_path = match raw.output_path {
            Some(path) if path.trim().is_empty() => return Err(SanitizeError::EmptyOutputPath),
            Some(path) => path.trim().to_string(),
            None => self.default_output_path.clone(),
        };

        let max_attempts = match raw.max_attempts {
            Some(n) if n > 0 => n,
            _ => self.default_max_attempts,
        };

        let random_identifier = random_identifier();
        let working_dir = self.temp_dir.join(&random_identifier);

        let mut task = Task {
            url,
            output_path,
            working_dir,
            random_identifier,
            failed: false,
            failure_code: None,
            past_failure_codes: Vec::new(),
            current_attempt: 1,
            max_attempts,
            storage: raw.storage,
            state: TaskState::Intake,
        };
        // Intake -> Sanitized is always a legal edge
        let _ = task.advance(TaskState::Sanitized);

        Ok(task)
    }
}

/// Add a scheme when missing and check the URL parses with a host
fn normalize_url(raw: &str) -> Result<String, SanitizeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SanitizeError::EmptyUrl);
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let parsed = Url::parse(&candidate).map_err(|e| SanitizeError::InvalidUrl {
        url: trimmed.to_string(),
        reason: e.to_string(),
    })?;

    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(SanitizeError::MissingHost(trimmed.to_string()));
    }

    Ok(parsed.to_string())
}

/// Random alphanumeric identifier for a task
pub fn random_identifier() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(IDENTIFIER_LEN)
        .map(char::from)
        .collect()
}

/// The sanitize stage worker
///
/// Admits new tasks from intake (counting each one in flight) and forwards
/// retried tasks from storage. Once intake is exhausted it keeps forwarding
/// retries until nothing is left in flight, then closes the crawl queue.
pub async fn run_sanitizer(
    sanitizer: Sanitizer,
    mut raw_rx: mpsc::Receiver<RawTask>,
    mut retry_rx: mpsc::UnboundedReceiver<Task>,
    sanitized_tx: mpsc::Sender<Task>,
    inflight: InFlight,
    cancel: CancellationToken,
) -> SanitizeReport {
    let mut report = SanitizeReport::default();
    let mut intake_open = true;

    loop {
        tokio::select! {
            raw = raw_rx.recv(), if intake_open => {
                let Some(raw) = raw else {
                    debug!("Intake exhausted, waiting for in-flight tasks to drain");
                    intake_open = false;
                    continue;
                };

                match sanitizer.sanitize(raw) {
                    Ok(task) => {
                        inflight.add();
                        report.admitted += 1;
                        debug!("Sanitized task {} ({})", task.random_identifier, task.url);
                        if sanitized_tx.send(task).await.is_err() {
                            warn!("Crawl queue closed, dropping sanitized task");
                            inflight.done();
                        }
                    }
                    Err(e) => {
                        report.rejected += 1;
                        warn!("Rejected task: {}", e);
                    }
                }
            }

            retried = retry_rx.recv() => {
                let Some(mut task) = retried else {
                    // Every storage worker is gone; nothing more can come back
                    break;
                };

                if let Err(e) = task.advance(TaskState::Sanitized) {
                    warn!("Retried task {} in unexpected state: {}", task.random_identifier, e);
                }
                debug!("Re-entering task {} for attempt {}", task.url, task.current_attempt);
                if sanitized_tx.send(task).await.is_err() {
                    warn!("Crawl queue closed, dropping retried task");
                    inflight.done();
                }
            }

            _ = inflight.wait_zero(), if !intake_open => {
                break;
            }

            _ = cancel.cancelled(), if intake_open => {
                debug!("Sanitizer cancelled, no longer admitting tasks");
                intake_open = false;
            }
        }
    }

    debug!("Sanitizer finished: {} admitted, {} rejected", report.admitted, report.rejected);
    report
}

/// What the sanitizer did over a whole run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SanitizeReport {
    pub admitted: usize,
    pub rejected: usize,
}
