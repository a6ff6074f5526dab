use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::browser::JS_TRACE_FILE;
use crate::crawler::lifecycle::TaskState;
use crate::crawler::task::{FinalResult, RawResult};

/// The postprocess stage worker
pub async fn run_postprocessor(mut raw_rx: mpsc::Receiver<RawResult>, final_tx: mpsc::Sender<FinalResult>) {
    while let Some(raw) = raw_rx.recv().await {
        let result = postprocess(raw).await;
        if final_tx.send(result).await.is_err() {
            warn!("Storage queue closed, stopping postprocessor");
            return;
        }
    }
    debug!("Postprocessor finished");
}

/// Turn a raw crawl result into a final result
pub async fn postprocess(raw: RawResult) -> FinalResult {
    let RawResult { mut task, mut stats, resource_metadata, script_metadata } = raw;
    stats.timing.begin_postprocess = Some(Utc::now());

    stats.raw_trace_size = match tokio::fs::metadata(task.working_dir.join(JS_TRACE_FILE)).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    stats.task_succeeded = !task.failed;
    stats.failure_code = task.failure_code.clone();

    if let Err(e) = task.advance(TaskState::Postprocessed) {
        warn!("{}", e);
    }

    stats.timing.end_postprocess = Some(Utc::now());

    FinalResult {
        task,
        stats,
        resource_metadata: resource_metadata.unwrap_or_else(empty_object),
        script_metadata: script_metadata.unwrap_or_else(empty_object),
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}
