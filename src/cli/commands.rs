use anyhow::{Result, Context};
use std::path::Path;
use tracing::{info, warn};

use crate::browser::create_browser;
use crate::cli::config::CrawlerConfig;
use crate::cli::PipelineOverrides;
use crate::crawler::intake::{FileTaskSource, QueueTaskSource, TaskSource};
use crate::crawler::pipeline::{Pipeline, PipelineReport};
use crate::crawler::task::TaskFile;
use crate::storage::{analytics, TaskQueue};

/// Run the pipeline over a task file
pub async fn run_file(config_path: Option<&Path>, taskfile: &Path, overrides: &PipelineOverrides) -> Result<()> {
    let mut config = CrawlerConfig::load(config_path)?;
    overrides.apply(&mut config);

    // Parse before starting anything, a bad task file is fatal
    let source = FileTaskSource::open(taskfile)?;

    let report = run_pipeline(config, Box::new(source)).await?;
    print_report(&report);
    Ok(())
}

/// Run the pipeline over tasks consumed from Redis
pub async fn run_client(
    config_path: Option<&Path>,
    redis_url: Option<String>,
    queue: Option<String>,
    exit_when_empty: bool,
    overrides: &PipelineOverrides,
) -> Result<()> {
    let mut config = CrawlerConfig::load(config_path)?;
    overrides.apply(&mut config);
    if let Some(url) = redis_url {
        config.queue.redis_url = url;
    }
    if let Some(name) = queue {
        config.queue.queue_name = name;
    }
    if exit_when_empty {
        config.queue.exit_when_empty = true;
    }

    let task_queue = TaskQueue::connect(&config.queue).await?;
    info!("Consuming tasks from queue {}", config.queue.queue_name);
    let source = QueueTaskSource::new(task_queue, config.queue.exit_when_empty);

    let report = run_pipeline(config, Box::new(source)).await?;
    print_report(&report);
    Ok(())
}

/// Build the pipeline's collaborators and run it, cancelling on Ctrl-C
async fn run_pipeline(config: CrawlerConfig, source: Box<dyn TaskSource>) -> Result<PipelineReport> {
    config.validate().context("Invalid configuration")?;

    let browser = create_browser(&config.browser)?;
    let recorder = match &config.analytics {
        Some(settings) => Some(analytics::connect(settings).await?),
        None => None,
    };

    let mut pipeline = Pipeline::new(config, browser)?;
    if let Some(recorder) = recorder {
        pipeline = pipeline.with_analytics(recorder);
    }

    let cancel = pipeline.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight tasks");
            cancel.cancel();
        }
    });

    pipeline.run(source).await
}

fn print_report(report: &PipelineReport) {
    println!("Tasks submitted: {}", report.submitted);
    println!("Tasks stored:    {}", report.stored);
    println!("Tasks abandoned: {}", report.abandoned);
    println!("Tasks rejected:  {}", report.rejected);
    println!("Retries:         {}", report.retried);
}

/// Push every task of a task file into the Redis queue
pub async fn enqueue(
    config_path: Option<&Path>,
    taskfile: &Path,
    redis_url: Option<String>,
    queue: Option<String>,
) -> Result<()> {
    let mut config = CrawlerConfig::load(config_path)?;
    if let Some(url) = redis_url {
        config.queue.redis_url = url;
    }
    if let Some(name) = queue {
        config.queue.queue_name = name;
    }

    let contents = std::fs::read_to_string(taskfile)
        .context(format!("Failed to read task file: {}", taskfile.display()))?;
    let tasks = serde_json::from_str::<TaskFile>(&contents)
        .context(format!("Failed to parse task file: {}", taskfile.display()))?
        .into_tasks();

    let task_queue = TaskQueue::connect(&config.queue).await?;
    for task in &tasks {
        task_queue.push_task(task).await?;
    }

    let pending = task_queue.pending_count().await?;
    println!("Enqueued {} tasks to {} ({} pending)", tasks.len(), config.queue.queue_name, pending);
    Ok(())
}

/// Print the effective configuration
pub fn show_config(config_path: Option<&Path>) -> Result<()> {
    let config = CrawlerConfig::load(config_path)?;
    let yaml = serde_yaml::to_string(&config).context("Failed to serialize configuration")?;
    println!("{}", yaml);

    if let Err(e) = config.validate() {
        warn!("Configuration is not valid: {}", e);
    }
    Ok(())
}

/// Write the default configuration
pub fn init_config(config_path: Option<&Path>) -> Result<()> {
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(CrawlerConfig::default_path);

    if path.exists() {
        warn!("Configuration already exists at {}, leaving it untouched", path.display());
        return Ok(());
    }

    CrawlerConfig::default().save_to_file(&path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}
