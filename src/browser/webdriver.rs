use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thirtyfour::prelude::*;
use tracing::{debug, warn};

use crate::browser::{Browser, CrawlFailure, CrawlOutput, FILES_SUBDIR, JS_TRACE_FILE, SCRIPTS_SUBDIR};
use crate::cli::config::BrowserSettings;
use crate::crawler::stats::TaskTiming;
use crate::crawler::task::Task;

const LAUNCH_FAILED: &str = "BrowserLaunchFailed";
const PAGE_LOAD_FAILED: &str = "PageLoadFailed";
const COLLECTION_FAILED: &str = "MetadataCollectionFailed";
const ARTIFACT_WRITE_FAILED: &str = "ArtifactWriteFailed";

/// Navigation timing, as absolute epoch milliseconds
const NAVIGATION_TIMING_SCRIPT: &str = r#"
const nav = performance.getEntriesByType('navigation')[0];
if (!nav) { return null; }
const origin = performance.timeOrigin;
return {
    connectEnd: origin + nav.connectEnd,
    domContentLoaded: origin + nav.domContentLoadedEventEnd,
    loadEvent: origin + nav.loadEventEnd
};
"#;

const RESOURCES_SCRIPT: &str = r#"
return performance.getEntriesByType('resource').map(r => ({
    url: r.name,
    initiator_type: r.initiatorType,
    transfer_size: r.transferSize,
    start_time: r.startTime,
    duration: r.duration
}));
"#;

const SCRIPTS_SCRIPT: &str = r#"
return Array.from(document.scripts).map(s => ({
    src: s.src || null,
    type: s.type || null,
    async: s.async,
    defer: s.defer,
    source: s.src ? null : s.text
}));
"#;

/// Drives a local or remote Chrome through a WebDriver endpoint
///
/// Every crawl gets a fresh browser whose profile lives in the task's
/// working directory, so nothing leaks between attempts.
pub struct WebDriverBrowser {
    config: BrowserSettings,
}

impl WebDriverBrowser {
    pub fn new(config: BrowserSettings) -> Self {
        Self { config }
    }

    async fn launch(&self, task: &Task) -> Result<WebDriver, CrawlFailure> {
        let launch_err = |e: WebDriverError| CrawlFailure::new(LAUNCH_FAILED, e.to_string());

        let mut caps = DesiredCapabilities::chrome();
        let profile = absolute(&task.working_dir.join("profile"));
        caps.add_chrome_arg(&format!("--user-data-dir={}", profile.display()))
            .map_err(launch_err)?;
        caps.add_chrome_arg("--disable-dev-shm-usage").map_err(launch_err)?;
        caps.add_chrome_arg("--no-first-run").map_err(launch_err)?;

        if self.config.headless {
            caps.set_headless().map_err(launch_err)?;
        }

        let driver = WebDriver::new(&self.config.webdriver_url, caps).await
            .map_err(launch_err)?;

        driver.set_page_load_timeout(Duration::from_secs(self.config.page_timeout_secs)).await
            .map_err(launch_err)?;

        Ok(driver)
    }

    /// Everything that happens while the browser is open
    async fn visit(
        &self,
        driver: &WebDriver,
        task: &Task,
        timing: &mut TaskTiming,
    ) -> Result<CrawlOutput, CrawlFailure> {
        debug!("Navigating to: {}", task.url);
        driver.goto(&task.url).await
            .map_err(|e| CrawlFailure::new(PAGE_LOAD_FAILED, e.to_string()))?;

        if let Some(nav) = run_script(driver, NAVIGATION_TIMING_SCRIPT).await?.as_object() {
            timing.connection_established = epoch_millis(nav.get("connectEnd"));
            timing.dom_content_event = epoch_millis(nav.get("domContentLoaded"));
            timing.load_event = epoch_millis(nav.get("loadEvent"));
        }

        let resources = run_script(driver, RESOURCES_SCRIPT).await?;
        let scripts = run_script(driver, SCRIPTS_SCRIPT).await?;

        let artifacts = ArtifactWriter::new(&task.working_dir);

        if task.storage.all_resources {
            let source = driver.source().await
                .map_err(|e| CrawlFailure::new(COLLECTION_FAILED, e.to_string()))?;
            artifacts.write(FILES_SUBDIR, "index.html", source.as_bytes()).await?;
        }

        let script_metadata = collect_scripts(&scripts, task.storage.all_scripts, &artifacts).await?;
        artifacts.write("", JS_TRACE_FILE, scripts.to_string().as_bytes()).await?;

        Ok(CrawlOutput {
            resource_metadata: task.storage.resource_metadata.then(|| index_entries(&resources)),
            script_metadata: task.storage.script_metadata.then_some(script_metadata),
        })
    }
}

#[async_trait]
impl Browser for WebDriverBrowser {
    async fn crawl(&self, task: &Task, timing: &mut TaskTiming) -> Result<CrawlOutput, CrawlFailure> {
        let driver = self.launch(task).await?;
        timing.browser_open = Some(Utc::now());

        let result = self.visit(&driver, task, timing).await;

        if let Err(e) = driver.quit().await {
            warn!("Failed to close browser session: {}", e);
        }
        timing.browser_close = Some(Utc::now());

        result
    }
}

/// Writes raw artifacts below a working directory
struct ArtifactWriter<'a> {
    root: &'a Path,
}

impl<'a> ArtifactWriter<'a> {
    fn new(root: &'a Path) -> Self {
        Self { root }
    }

    async fn write(&self, subdir: &str, name: &str, contents: &[u8]) -> Result<(), CrawlFailure> {
        let dir = self.root.join(subdir);
        let write_err = |e: std::io::Error| CrawlFailure::new(ARTIFACT_WRITE_FAILED, e.to_string());

        tokio::fs::create_dir_all(&dir).await.map_err(write_err)?;
        tokio::fs::write(dir.join(name), contents).await.map_err(write_err)
    }
}

/// Key script entries by index, saving inline sources when requested
async fn collect_scripts(
    scripts: &Value,
    save_sources: bool,
    artifacts: &ArtifactWriter<'_>,
) -> Result<Value, CrawlFailure> {
    let mut metadata = Map::new();

    for (i, script) in scripts.as_array().into_iter().flatten().enumerate() {
        let source = script.get("source").and_then(Value::as_str);

        if save_sources {
            if let Some(source) = source {
                artifacts.write(SCRIPTS_SUBDIR, &format!("{}.js", i), source.as_bytes()).await?;
            }
        }

        metadata.insert(i.to_string(), json!({
            "src": script.get("src").cloned().unwrap_or(Value::Null),
            "type": script.get("type").cloned().unwrap_or(Value::Null),
            "async": script.get("async").cloned().unwrap_or(Value::Bool(false)),
            "defer": script.get("defer").cloned().unwrap_or(Value::Bool(false)),
            "inline": source.is_some(),
            "length": source.map_or(0, str::len),
        }));
    }

    Ok(Value::Object(metadata))
}

/// Turn a JSON array into an object keyed by position
fn index_entries(entries: &Value) -> Value {
    let map = entries.as_array()
        .into_iter()
        .flatten()
        .enumerate()
        .map(|(i, entry)| (i.to_string(), entry.clone()))
        .collect::<Map<String, Value>>();
    Value::Object(map)
}

async fn run_script(driver: &WebDriver, script: &str) -> Result<Value, CrawlFailure> {
    let ret = driver.execute(script, Vec::new()).await
        .map_err(|e| CrawlFailure::new(COLLECTION_FAILED, e.to_string()))?;
    Ok(ret.json().clone())
}

fn epoch_millis(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let millis = value?.as_f64()?;
    // Entries are 0 when the event never fired
    if millis <= 0.0 {
        return None;
    }
    Utc.timestamp_millis_opt(millis as i64).single()
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
