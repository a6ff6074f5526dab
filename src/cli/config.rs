use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, debug, error};

/// Configuration problems detected before any worker starts
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid pool size for {pool}: {size} (must be at least 1)")]
    PoolSize { pool: &'static str, size: usize },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct CrawlerConfig {
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub monitoring: MonitoringSettings,
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default)]
    pub browser: BrowserSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub analytics: Option<AnalyticsSettings>,
}

/// Worker pools and task defaults
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineSettings {
    /// Number of simultaneous browser instances
    pub crawlers: usize,
    /// Number of storage workers
    pub storers: usize,
    /// Capacity of each handoff queue between stages
    pub queue_capacity: usize,
    /// Attempts per task when the task does not say otherwise
    pub default_max_attempts: u32,
    /// Output destination when the task does not say otherwise
    pub output_path: String,
    /// Root of all per-task working directories
    pub temp_dir: PathBuf,
    /// Route storage failures into the retry path instead of only logging them
    pub retry_on_storage_error: bool,
}

/// Monitoring sink settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MonitoringSettings {
    pub enabled: bool,
    pub port: u16,
    /// Capacity of the stats queue feeding the sink
    pub stats_buffer: usize,
}

/// Remote (SSH) storage settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RemoteSettings {
    pub backoff_base_ms: u64,
    pub backoff_multiplier: u32,
    pub ssh_binary: String,
    pub scp_binary: String,
    /// Directory holding SSH control sockets
    pub control_dir: PathBuf,
}

/// Which browser backend runs the crawl
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrowserDriver {
    /// Drive Chrome through a WebDriver endpoint
    Webdriver,
    /// Delegate to a remote browser service over HTTP
    Service,
}

/// Browser settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrowserSettings {
    pub driver: BrowserDriver,
    pub webdriver_url: String,
    pub service_url: String,
    pub headless: bool,
    pub page_timeout_secs: u64,
}

/// Redis task queue settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueueSettings {
    pub redis_url: String,
    pub queue_name: String,
    /// Seconds a blocking pop waits before checking for cancellation
    pub poll_timeout_secs: u64,
    /// Stop intake when the queue is empty instead of waiting for more tasks
    pub exit_when_empty: bool,
}

/// Optional SQL analytics sink
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnalyticsSettings {
    pub connection_string: String,
    pub table: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            crawlers: 1,
            storers: 1,
            queue_capacity: 1,
            default_max_attempts: 2,
            output_path: "results".to_string(),
            temp_dir: PathBuf::from(".tmp"),
            retry_on_storage_error: false,
        }
    }
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8001,
            stats_buffer: 64,
        }
    }
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1000,
            backoff_multiplier: 2,
            ssh_binary: "ssh".to_string(),
            scp_binary: "scp".to_string(),
            control_dir: std::env::temp_dir().join("crawler-ssh"),
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            driver: BrowserDriver::Webdriver,
            webdriver_url: "http://localhost:9515".to_string(),
            service_url: "http://localhost:5000".to_string(),
            headless: true,
            page_timeout_secs: 30,
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            queue_name: "crawler:tasks".to_string(),
            poll_timeout_secs: 5,
            exit_when_empty: false,
        }
    }
}

impl RemoteSettings {
    /// Base delay of the remote backoff policy
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

impl CrawlerConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("org", "measure-crawler", "measure-crawler") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        }
    }

    /// Path of the default configuration file
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("default.yaml")
    }

    /// Load the configuration from `path`, or from the default location
    ///
    /// A missing default file is created from the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_file(path);
        }

        let config_path = Self::default_path();
        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            if let Err(e) = config.save_to_file(&config_path) {
                error!("Failed to save default configuration: {}", e);
            }
            Ok(config)
        }
    }

    /// Load configuration from a file
    fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// Check everything the pipeline relies on at startup
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pipeline = &self.pipeline;

        if pipeline.crawlers < 1 {
            return Err(ConfigError::PoolSize { pool: "crawlers", size: pipeline.crawlers });
        }
        if pipeline.storers < 1 {
            return Err(ConfigError::PoolSize { pool: "storers", size: pipeline.storers });
        }
        if pipeline.queue_capacity < 1 {
            return Err(invalid("pipeline.queue_capacity", "must be at least 1"));
        }
        if pipeline.default_max_attempts < 1 {
            return Err(invalid("pipeline.default_max_attempts", "must be at least 1"));
        }
        if pipeline.output_path.trim().is_empty() {
            return Err(invalid("pipeline.output_path", "cannot be empty"));
        }
        if pipeline.temp_dir.as_os_str().is_empty() {
            return Err(invalid("pipeline.temp_dir", "cannot be empty"));
        }

        if self.monitoring.enabled {
            if self.monitoring.port == 0 {
                return Err(invalid("monitoring.port", "cannot be 0"));
            }
            if self.monitoring.stats_buffer < 1 {
                return Err(invalid("monitoring.stats_buffer", "must be at least 1"));
            }
        }

        if self.remote.backoff_multiplier < 1 {
            return Err(invalid("remote.backoff_multiplier", "must be at least 1"));
        }
        if self.remote.backoff_base_ms == 0 {
            return Err(invalid("remote.backoff_base_ms", "must be greater than 0"));
        }

        if let Some(analytics) = &self.analytics {
            let valid_table = !analytics.table.is_empty()
                && analytics.table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid_table {
                return Err(invalid(
                    "analytics.table",
                    "must be a non-empty identifier of letters, digits and underscores",
                ));
            }
        }

        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.to_string() }
}
