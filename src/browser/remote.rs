use anyhow::{Result, Context};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Serialize, Deserialize};
use std::time::Duration;
use tracing::debug;

use crate::browser::{Browser, CrawlFailure, CrawlOutput};
use crate::cli::config::BrowserSettings;
use crate::crawler::stats::TaskTiming;
use crate::crawler::task::{StorageFlags, Task};

/// Failure codes for problems talking to the service itself
const SERVICE_UNREACHABLE: &str = "BrowserServiceUnreachable";
const SERVICE_BAD_RESPONSE: &str = "BrowserServiceBadResponse";
const SERVICE_UNKNOWN: &str = "BrowserServiceUnknownError";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserServiceRequest {
    pub url: String,
    pub random_identifier: String,
    pub working_dir: String,
    pub timeout_secs: u64,
    #[serde(flatten)]
    pub storage: StorageFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserServiceResponse {
    pub success: bool,
    #[serde(default)]
    pub failure_code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub resource_metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub script_metadata: Option<serde_json::Value>,
}

/// Delegates crawls to a browser service over HTTP
///
/// The service writes raw artifacts into the working directory it is given,
/// so it must share that filesystem with the pipeline.
pub struct RemoteBrowserService {
    client: Client,
    base_url: String,
    timeout_secs: u64,
}

impl RemoteBrowserService {
    pub fn new(settings: &BrowserSettings) -> Result<Self> {
        // Leave the service room to hit its own page timeout first
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.page_timeout_secs + 30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: settings.service_url.trim_end_matches('/').to_string(),
            timeout_secs: settings.page_timeout_secs,
        })
    }
}

#[async_trait]
impl Browser for RemoteBrowserService {
    async fn crawl(&self, task: &Task, timing: &mut TaskTiming) -> Result<CrawlOutput, CrawlFailure> {
        let endpoint = format!("{}/crawl", self.base_url);

        let request = BrowserServiceRequest {
            url: task.url.clone(),
            random_identifier: task.random_identifier.clone(),
            working_dir: task.working_dir.display().to_string(),
            timeout_secs: self.timeout_secs,
            storage: task.storage,
        };

        debug!("Sending request to browser service: {}", task.url);
        timing.browser_open = Some(Utc::now());

        let response = self.client.post(&endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| CrawlFailure::new(SERVICE_UNREACHABLE, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CrawlFailure::new(
                SERVICE_BAD_RESPONSE,
                format!("Browser service returned HTTP {}", status),
            ));
        }

        let response = response.json::<BrowserServiceResponse>()
            .await
            .map_err(|e| CrawlFailure::new(SERVICE_BAD_RESPONSE, e.to_string()))?;

        timing.browser_close = Some(Utc::now());

        if !response.success {
            let code = response.failure_code.unwrap_or_else(|| SERVICE_UNKNOWN.to_string());
            let message = response.error.unwrap_or_else(|| "crawl failed".to_string());
            return Err(CrawlFailure::new(code, message));
        }

        debug!("Browser service crawled URL: {}", task.url);

        Ok(CrawlOutput {
            resource_metadata: response.resource_metadata,
            script_metadata: response.script_metadata,
        })
    }
}
