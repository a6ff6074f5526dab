pub mod remote;
pub mod webdriver;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::cli::config::{BrowserDriver, BrowserSettings};
use crate::crawler::stats::TaskTiming;
use crate::crawler::task::Task;

// Re-export common types
pub use remote::RemoteBrowserService;
pub use webdriver::WebDriverBrowser;

/// Artifact locations inside a task's working directory
pub const FILES_SUBDIR: &str = "files";
pub const SCRIPTS_SUBDIR: &str = "scripts";
pub const JS_TRACE_FILE: &str = "js_trace.json";

/// Metadata a successful crawl hands back to the pipeline
///
/// Raw resources and scripts are written by the browser into the task's
/// working directory; only the metadata travels in memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrawlOutput {
    pub resource_metadata: Option<Value>,
    pub script_metadata: Option<Value>,
}

/// A crawl-level failure, identified by a failure code
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct CrawlFailure {
    pub code: String,
    pub message: String,
}

impl CrawlFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// The browser automation engine that actually visits a URL
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Browser: Send + Sync {
    /// Visit the task's URL, writing artifacts into its working directory
    ///
    /// Browser-side phase timestamps are recorded into `timing`.
    async fn crawl(&self, task: &Task, timing: &mut TaskTiming) -> Result<CrawlOutput, CrawlFailure>;
}

/// Build the browser backend selected in the settings
pub fn create_browser(settings: &BrowserSettings) -> anyhow::Result<Arc<dyn Browser>> {
    match settings.driver {
        BrowserDriver::Webdriver => Ok(Arc::new(WebDriverBrowser::new(settings.clone()))),
        BrowserDriver::Service => Ok(Arc::new(RemoteBrowserService::new(settings)?)),
    }
}
